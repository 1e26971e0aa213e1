use std::{
    hint::black_box,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use gc_threads::{base::utils::read_uint_from_env, RootKind, ThreadHandle, Threads, ThreadsConfig};

fn main() {
    env_logger::init();

    let config = ThreadsConfig::from_env();
    let workers = read_uint_from_env("GC_DEMO_THREADS").unwrap_or(4);
    let cycles = read_uint_from_env("GC_DEMO_CYCLES").unwrap_or(100);
    log::info!(target: "gc-threads", "{}; {} worker(s), {} cycle(s)", config, workers, cycles);

    let threads = Arc::new(Threads::native(config));
    let stop = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicUsize::new(0));

    let joins = (0..workers)
        .map(|i| {
            let stop = stop.clone();
            let started = started.clone();
            let handle = ThreadHandle::new(move || {
                started.fetch_add(1, Ordering::AcqRel);
                let mut x = i as u64;
                while !stop.load(Ordering::Acquire) {
                    x = black_box(x.wrapping_mul(6364136223846793005).wrapping_add(1));
                }
            })
            .with_name(format!("mutator-{}", i));
            threads
                .start(Arc::new(handle))
                .unwrap_or_else(|err| panic!("{}", err))
        })
        .collect::<Vec<_>>();

    while started.load(Ordering::Acquire) != workers {
        std::thread::yield_now();
    }

    let mut worst = Duration::ZERO;
    let mut total = Duration::ZERO;
    for cycle in 0..cycles {
        let start = Instant::now();
        let world = match threads.suspend_all() {
            Ok(world) => world,
            Err(err) => {
                log::error!(target: "gc-threads", "cycle {}: {}", cycle, err);
                continue;
            }
        };

        let mut stack_bytes = 0usize;
        let mut tls_bytes = 0usize;
        world.scan_all_type(&mut |kind, start, end| {
            let len = end as usize - start as usize;
            match kind {
                RootKind::Stack => stack_bytes += len,
                RootKind::Tls => tls_bytes += len,
            }
        });
        world.process_gc_marks(&|_| true);
        drop(world);

        let pause = start.elapsed();
        worst = worst.max(pause);
        total += pause;
        log::debug!(
            target: "gc-threads",
            "cycle {}: {} stack byte(s), {} TLS byte(s), paused {:.3} ms",
            cycle,
            stack_bytes,
            tls_bytes,
            pause.as_micros() as f64 / 1000.0
        );
    }

    stop.store(true, Ordering::Release);
    for join in joins {
        if join.join().is_err() {
            log::error!(target: "gc-threads", "a mutator panicked");
        }
    }

    log::info!(
        target: "gc-threads",
        "{} cycle(s): average pause {:.3} ms, worst {:.3} ms",
        cycles,
        total.as_micros() as f64 / 1000.0 / cycles.max(1) as f64,
        worst.as_micros() as f64 / 1000.0
    );
}
