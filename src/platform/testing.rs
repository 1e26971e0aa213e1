use std::sync::atomic::{AtomicUsize, Ordering};

use errno::Errno;
use parking_lot::Mutex;

use super::Platform;
use crate::thread::ThreadHandle;

/// Stand-in backend that records requests instead of stopping anything.
pub(crate) struct RecordingPlatform {
    next_id: AtomicUsize,
    pub(crate) suspends: AtomicUsize,
    pub(crate) resumes: AtomicUsize,
    pub(crate) waits: Mutex<Vec<usize>>,
    /// `os_thread` id whose suspension fails.
    pub(crate) fail_suspend_of: AtomicUsize,
    /// `(os_thread, start, end)` segments reported as thread-local storage.
    pub(crate) tls_segments: Mutex<Vec<(usize, usize, usize)>>,
}

impl RecordingPlatform {
    pub(crate) const ESRCH: i32 = 3;

    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            suspends: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            waits: Mutex::new(Vec::new()),
            fail_suspend_of: AtomicUsize::new(0),
            tls_segments: Mutex::new(Vec::new()),
        }
    }
}

impl Platform for RecordingPlatform {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn bind_current(&self, thread: &ThreadHandle) {
        thread.set_os_thread(self.next_id.fetch_add(1, Ordering::Relaxed));
    }

    unsafe fn suspend(&self, thread: &ThreadHandle) -> Result<(), Errno> {
        if thread.os_thread() == self.fail_suspend_of.load(Ordering::Relaxed) {
            return Err(Errno(Self::ESRCH));
        }
        self.suspends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn wait_for_suspend(&self, count: usize) -> bool {
        self.waits.lock().push(count);
        false
    }

    unsafe fn resume(&self, _thread: &ThreadHandle) -> Result<(), Errno> {
        self.resumes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn thread_tls(&self, thread: &ThreadHandle, scan: &mut dyn FnMut(*mut u8, *mut u8)) {
        for &(id, start, end) in self.tls_segments.lock().iter() {
            if id == thread.os_thread() {
                scan(start as *mut u8, end as *mut u8);
            }
        }
    }
}

/// Shares one recording backend between a registry and the test inspecting it.
pub(crate) struct Shared<P>(pub(crate) std::sync::Arc<P>);

impl<P: Platform> Platform for Shared<P> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn bind_current(&self, thread: &ThreadHandle) {
        self.0.bind_current(thread)
    }

    fn unbind(&self, thread: &ThreadHandle) {
        self.0.unbind(thread)
    }

    unsafe fn suspend(&self, thread: &ThreadHandle) -> Result<(), Errno> {
        self.0.suspend(thread)
    }

    fn wait_for_suspend(&self, count: usize) -> bool {
        self.0.wait_for_suspend(count)
    }

    unsafe fn resume(&self, thread: &ThreadHandle) -> Result<(), Errno> {
        self.0.resume(thread)
    }

    fn thread_tls(&self, thread: &ThreadHandle, scan: &mut dyn FnMut(*mut u8, *mut u8)) {
        self.0.thread_tls(thread, scan)
    }
}
