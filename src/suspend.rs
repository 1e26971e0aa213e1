//! Stop-the-world suspension.
//!
//! [`Threads::suspend_all`] stops every registered thread other than the
//! caller and returns a [`SuspendedWorld`] guard; dropping the guard resumes
//! them. Suspensions nest: only the outermost one talks to other threads, the
//! inner ones just bump the depth.

use std::{
    marker::PhantomData,
    ptr,
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

use errno::Errno;

use crate::{
    error::{Error, Result},
    scan::RootKind,
    thread::{current_handle, ThreadHandle},
    threads::Threads,
};

/// Proof that the world is suspended by the calling thread.
///
/// Not `Send`: the registry lock it holds belongs to the suspending thread.
#[must_use = "the world resumes as soon as the guard is dropped"]
pub struct SuspendedWorld<'a> {
    threads: &'a Threads,
    marker: PhantomData<*mut ()>,
}

impl<'a> SuspendedWorld<'a> {
    fn new(threads: &'a Threads) -> Self {
        Self {
            threads,
            marker: PhantomData,
        }
    }

    pub fn depth(&self) -> usize {
        self.threads.suspend_depth()
    }

    pub fn threads(&self) -> &'a Threads {
        self.threads
    }

    pub fn scan_all_type(&self, scan: &mut dyn FnMut(RootKind, *mut u8, *mut u8)) {
        self.threads.scan_all_type(scan)
    }

    pub fn process_gc_marks(&self, is_marked: &dyn Fn(*mut u8) -> bool) {
        self.threads.process_gc_marks(is_marked)
    }

    /// Same as dropping the guard.
    pub fn resume(self) {}
}

impl Drop for SuspendedWorld<'_> {
    fn drop(&mut self) {
        self.threads.resume_all();
    }
}

/// Outcome of stopping the world. Kept under the registry lock and logged
/// only once the world runs again: a stopped thread may hold the allocator
/// or stderr lock.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StopReport {
    pub(crate) signalled: usize,
    pub(crate) pruned: usize,
    pub(crate) took: Duration,
    pub(crate) slow: bool,
}

impl Threads {
    pub fn suspend_depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_depth() != 0
    }

    /// Suspends every registered thread except the caller.
    ///
    /// Threads that finished their entry point but have not deregistered yet
    /// are dropped from the registry instead of being signalled. If any other
    /// thread cannot be signalled, the threads stopped so far are resumed and
    /// the error is returned with the world running again.
    ///
    /// The registry lock is held for the whole lifetime of the returned guard,
    /// so threads trying to register or start block until the world resumes.
    pub fn suspend_all(&self) -> Result<SuspendedWorld<'_>> {
        self.lock_raw();
        if self.depth.fetch_add(1, Ordering::AcqRel) != 0 {
            return Ok(SuspendedWorld::new(self));
        }

        if !self.multithreaded.load(Ordering::Acquire) && self.only_caller_registered() {
            // Nobody else to stop yet.
            return Ok(SuspendedWorld::new(self));
        }

        match self.stop_the_world() {
            Ok(report) => {
                unsafe { self.inner() }.stopped = Some(report);
                Ok(SuspendedWorld::new(self))
            }
            Err(err) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                unsafe { self.unlock_raw() };
                Err(err)
            }
        }
    }

    /// Lock held.
    fn only_caller_registered(&self) -> bool {
        let me = current_handle();
        unsafe { self.inner() }
            .threads
            .iter()
            .all(|thread| ptr::eq(thread, me))
    }

    /// Lock held. Unlinks threads that finished their entry point but have not
    /// deregistered yet; their own deregistration then finds nothing to do.
    unsafe fn prune_exited(&self, me: *const ThreadHandle) -> usize {
        let inner = self.inner();
        let mut pruned = 0;
        let mut node = inner.threads.head();
        while !node.is_null() {
            let thread = &*node;
            node = thread.links().next;
            if !ptr::eq(thread, me) && !thread.is_running() {
                self.unlink(inner, thread);
                pruned += 1;
            }
        }
        pruned
    }

    fn stop_the_world(&self) -> Result<StopReport> {
        let start = Instant::now();
        let me = current_handle();
        let pruned = unsafe { self.prune_exited(me) };
        let inner = unsafe { self.inner() };
        let mut signalled = 0usize;
        let mut failed: Option<(*const ThreadHandle, Errno)> = None;

        {
            let _critical = self.critical_lock.lock();
            for thread in inner.threads.iter() {
                if ptr::eq(thread, me) {
                    continue;
                }

                match unsafe { self.platform.suspend(thread) } {
                    Ok(()) => signalled += 1,
                    Err(errno) => {
                        failed = Some((thread as *const ThreadHandle, errno));
                        break;
                    }
                }
            }
        }

        let slow = self.platform.wait_for_suspend(signalled);

        if let Some((thread, errno)) = failed {
            // Every signalled thread precedes the failed one in list order.
            let mut resumed = 0;
            for other in inner.threads.iter() {
                if resumed == signalled {
                    break;
                }
                if ptr::eq(other, me) {
                    continue;
                }
                self.resume_thread(other);
                resumed += 1;
            }

            let thread = unsafe { &*thread };
            log::error!(
                target: "gc-safepoint",
                "failed to suspend thread {}: {} ({} thread(s) resumed)",
                thread.label(),
                errno,
                resumed
            );
            return Err(Error::Suspend {
                thread: thread.name().map(str::to_owned),
                errno,
            });
        }

        Ok(StopReport {
            signalled,
            pruned,
            took: start.elapsed(),
            slow,
        })
    }

    fn resume_all(&self) {
        if self.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(report) = unsafe { self.inner() }.stopped.take() {
                let start = Instant::now();
                let me = current_handle();
                let mut resumed = 0usize;
                for thread in unsafe { self.inner() }.threads.iter() {
                    if ptr::eq(thread, me) {
                        continue;
                    }
                    self.resume_thread(thread);
                    resumed += 1;
                }

                if report.slow {
                    log::warn!(
                        target: "gc-safepoint",
                        "suspending {} thread(s) took {} ms",
                        report.signalled,
                        report.took.as_millis()
                    );
                }
                log::debug!(
                    target: "gc-safepoint",
                    "suspended {} thread(s) in {:.3} ms ({} exited), resumed {} in {:.3} ms",
                    report.signalled,
                    report.took.as_micros() as f64 / 1000.0,
                    report.pruned,
                    resumed,
                    start.elapsed().as_micros() as f64 / 1000.0
                );
            }
        }

        unsafe { self.unlock_raw() };
    }

    /// Resets the range the thread currently runs on; ranges it switched away
    /// from keep the top published at the switch. A resume failure leaves a
    /// thread stopped forever; it is fatal.
    fn resume_thread(&self, thread: &ThreadHandle) {
        if !thread.in_critical_region() {
            let ctx = thread.current_context();
            ctx.set_top(ctx.bottom());
        }

        if let Err(errno) = unsafe { self.platform.resume(thread) } {
            panic!("failed to resume thread {}: {}", thread.label(), errno);
        }
    }
}
