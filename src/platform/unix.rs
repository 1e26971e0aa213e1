//! Signal based suspension for POSIX threads.
//!
//! A thread is stopped by sending it the suspend signal. Its handler spills
//! the registers, publishes the stack top, acknowledges through the counter of
//! the backend that sent the signal and then sleeps in `sigsuspend` until the
//! resume signal arrives and the thread's resume epoch has moved on.

use std::{
    mem::MaybeUninit,
    ptr::null_mut,
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};

use errno::{errno, set_errno, Errno};
use libc::{c_int, sigaction, sigdelset, sigfillset, sigset_t, sigsuspend, SA_RESTART};
use once_cell::sync::OnceCell;
use parking_lot_core::SpinWait;

use super::Platform;
use crate::{
    base::stack::with_spilled_registers,
    config::ThreadsConfig,
    thread::{current_handle, ThreadHandle},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Signals {
    suspend: c_int,
    resume: c_int,
}

/// Handlers are process wide; the first backend created picks the signals.
static INSTALLED: OnceCell<Signals> = OnceCell::new();

pub struct SignalPlatform {
    signals: Signals,
    acks: AtomicUsize,
    warn_after: std::time::Duration,
}

impl SignalPlatform {
    pub fn new(config: &ThreadsConfig) -> Self {
        let wanted = Signals {
            suspend: config.suspend_signal,
            resume: config.resume_signal,
        };
        let signals = *INSTALLED.get_or_init(|| {
            install_signal_handlers(wanted);
            wanted
        });
        if signals != wanted {
            log::warn!(
                target: "gc-threads",
                "suspend handlers already installed for signals {}/{}, ignoring {}/{}",
                signals.suspend,
                signals.resume,
                wanted.suspend,
                wanted.resume
            );
        }

        Self {
            signals,
            acks: AtomicUsize::new(0),
            warn_after: config.suspend_warn_after,
        }
    }
}

impl Platform for SignalPlatform {
    fn name(&self) -> &'static str {
        "posix-signals"
    }

    fn bind_current(&self, thread: &ThreadHandle) {
        thread.set_os_thread(unsafe { libc::pthread_self() } as usize);
    }

    unsafe fn suspend(&self, thread: &ThreadHandle) -> Result<(), Errno> {
        thread.mailbox.acks.store(
            &self.acks as *const AtomicUsize as *mut AtomicUsize,
            Ordering::Release,
        );
        match libc::pthread_kill(thread.os_thread() as libc::pthread_t, self.signals.suspend) {
            0 => Ok(()),
            rc => Err(Errno(rc)),
        }
    }

    fn wait_for_suspend(&self, count: usize) -> bool {
        let start = Instant::now();
        let mut spin = SpinWait::new();

        while self.acks.load(Ordering::Acquire) < count {
            if !spin.spin() {
                std::thread::yield_now();
            }
        }

        self.acks.fetch_sub(count, Ordering::AcqRel);
        start.elapsed() >= self.warn_after
    }

    unsafe fn resume(&self, thread: &ThreadHandle) -> Result<(), Errno> {
        thread.mailbox.resumes.fetch_add(1, Ordering::AcqRel);
        match libc::pthread_kill(thread.os_thread() as libc::pthread_t, self.signals.resume) {
            0 => Ok(()),
            rc => Err(Errno(rc)),
        }
    }
}

fn install_signal_handlers(signals: Signals) {
    unsafe {
        let mut act: sigaction = MaybeUninit::<sigaction>::zeroed().assume_init();

        // Nothing may interrupt a parked thread except the resume signal,
        // which sigsuspend unblocks explicitly.
        sigfillset(&mut act.sa_mask);
        act.sa_sigaction = suspend_handler as usize;
        act.sa_flags = SA_RESTART;
        if sigaction(signals.suspend, &act, null_mut()) < 0 {
            panic!(
                "failed to install suspend handler for signal {}: {}",
                signals.suspend,
                errno()
            );
        }

        act.sa_sigaction = resume_handler as usize;
        if sigaction(signals.resume, &act, null_mut()) < 0 {
            panic!(
                "failed to install resume handler for signal {}: {}",
                signals.resume,
                errno()
            );
        }
    }

    log::debug!(
        target: "gc-threads",
        "installed suspend/resume handlers on signals {}/{}",
        signals.suspend,
        signals.resume
    );
}

extern "C" fn suspend_handler(_sig: c_int) {
    let saved = errno();
    let thread = current_handle();
    if !thread.is_null() {
        with_spilled_registers(&mut |sp| unsafe { park(&*thread, sp) });
    }
    set_errno(saved);
}

extern "C" fn resume_handler(_sig: c_int) {}

/// Runs inside the suspend handler. Only async-signal-safe work here: atomics
/// and `sigsuspend`.
unsafe fn park(thread: &ThreadHandle, sp: *mut u8) {
    if !thread.in_critical_region() {
        thread.current_context().set_top(sp);
    }

    let mailbox = &thread.mailbox;
    let seen = mailbox.resumes.load(Ordering::Acquire);
    let acks = mailbox.acks.load(Ordering::Acquire);
    if !acks.is_null() {
        (*acks).fetch_add(1, Ordering::AcqRel);
    }

    let signals = match INSTALLED.get() {
        Some(signals) => *signals,
        None => return,
    };
    let mut mask: sigset_t = MaybeUninit::zeroed().assume_init();
    sigfillset(&mut mask);
    sigdelset(&mut mask, signals.resume);
    while mailbox.resumes.load(Ordering::Acquire) == seen {
        sigsuspend(&mask);
    }
}
