//! OS-specific half of suspension: binding handles to OS threads, delivering
//! suspend/resume requests and capturing register state.

use errno::Errno;

use crate::{base::stack, thread::ThreadHandle};

#[cfg(test)]
pub(crate) mod testing;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use self::unix::SignalPlatform as NativePlatform;
    } else if #[cfg(all(windows, target_arch = "x86_64"))] {
        mod windows;
        pub use self::windows::Win32Platform as NativePlatform;
    } else {
        compile_error!("gc-threads supports unix and x86_64 windows targets only");
    }
}

/// Capabilities the suspend coordinator needs from the OS.
///
/// Every method except [`wait_for_suspend`](Platform::wait_for_suspend) is
/// called with the registry lock held.
pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Records the calling OS thread's identity in `thread`.
    fn bind_current(&self, thread: &ThreadHandle);

    /// Releases whatever [`bind_current`](Platform::bind_current) acquired.
    /// Runs on the bound thread itself.
    fn unbind(&self, thread: &ThreadHandle) {
        thread.set_os_thread(0);
    }

    /// Start address of the calling thread's stack.
    fn stack_bottom(&self) -> *mut u8 {
        stack::current_stack_bottom()
    }

    /// Requests that `thread` stop. Completion is observed through
    /// [`wait_for_suspend`](Platform::wait_for_suspend).
    ///
    /// # Safety
    ///
    /// `thread` must be bound to a live OS thread that is not the caller.
    unsafe fn suspend(&self, thread: &ThreadHandle) -> Result<(), Errno>;

    /// Blocks until `count` threads requested since the last call have
    /// stopped and published their stack tops. Returns true if that took
    /// longer than the configured warning threshold.
    ///
    /// Must not log or allocate: the threads already stopped may hold the
    /// locks either needs.
    fn wait_for_suspend(&self, count: usize) -> bool;

    /// # Safety
    ///
    /// `thread` must have been stopped by [`suspend`](Platform::suspend).
    unsafe fn resume(&self, thread: &ThreadHandle) -> Result<(), Errno>;

    /// Extra `[start, end)` ranges the platform holds for a suspended thread,
    /// such as a register snapshot taken from outside the thread.
    fn thread_roots(&self, _thread: &ThreadHandle, _scan: &mut dyn FnMut(*mut u8, *mut u8)) {}

    /// Thread-local storage segments of a suspended thread the platform knows
    /// how to find. The native backends know none; thread-local roots then
    /// come from the [`TlsGc`](crate::TlsGc) collaborator alone.
    fn thread_tls(&self, _thread: &ThreadHandle, _scan: &mut dyn FnMut(*mut u8, *mut u8)) {}

    /// Spills callee-saved registers onto the stack and runs `f` with an
    /// address below them.
    fn with_spilled_registers(&self, f: &mut dyn FnMut(*mut u8)) {
        stack::with_spilled_registers(f)
    }
}
