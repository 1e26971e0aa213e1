//! Conservative root enumeration for a suspended world.

use std::mem::size_of;

use crate::{
    context::StackContext,
    thread::{current_handle, ThreadHandle},
    threads::Threads,
};

/// What a reported `[start, end)` range holds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RootKind {
    /// Machine stacks, register snapshots and the pending-start buffer.
    Stack,
    /// Auxiliary per-thread collector data.
    Tls,
}

/// Publishes the scanning thread's own stack top for the duration of a scan
/// and restores the previous value afterwards, also on unwind.
struct PublishedTop<'a> {
    ctx: &'a StackContext,
    saved: *mut u8,
}

impl<'a> PublishedTop<'a> {
    fn new(thread: &'a ThreadHandle, top: *mut u8) -> Option<Self> {
        if thread.in_critical_region() {
            return None;
        }
        let ctx = thread.current_context();
        let saved = ctx.top();
        ctx.set_top(top);
        Some(Self { ctx, saved })
    }
}

impl Drop for PublishedTop<'_> {
    fn drop(&mut self) {
        self.ctx.set_top(self.saved);
    }
}

impl Threads {
    /// Reports every root range of the suspended world to `scan`: the
    /// pending-start buffer, each non-empty stack range (the caller's own
    /// included, with its registers spilled), and each thread's auxiliary
    /// data.
    ///
    /// `scan` runs while other threads are stopped at arbitrary points, so it
    /// must not allocate through an allocator those threads might hold.
    pub fn scan_all_type(&self, scan: &mut dyn FnMut(RootKind, *mut u8, *mut u8)) {
        assert!(
            self.is_suspended(),
            "scan_all_type called while the world is running"
        );

        let me = self.current();
        self.platform.with_spilled_registers(&mut |sp| {
            let _top = me.and_then(|thread| PublishedTop::new(thread, sp));
            self.scan_roots(scan);
        });
    }

    /// Stack ranges only, for collectors that do not distinguish root kinds.
    pub fn scan_all(&self, scan: &mut dyn FnMut(*mut u8, *mut u8)) {
        self.scan_all_type(&mut |kind, start, end| {
            if kind == RootKind::Stack {
                scan(start, end)
            }
        });
    }

    fn scan_roots(&self, scan: &mut dyn FnMut(RootKind, *mut u8, *mut u8)) {
        let inner = unsafe { self.inner() };

        if !inner.pending.is_empty() {
            let start = inner.pending.as_ptr() as *mut u8;
            let end = unsafe { start.add(inner.pending.len() * size_of::<*const ThreadHandle>()) };
            scan(RootKind::Stack, start, end);
        }

        for ctx in inner.contexts.iter() {
            if let Some((start, end)) = ctx.scan_range() {
                scan(RootKind::Stack, start, end);
            }
        }

        let me = current_handle();
        for thread in inner.threads.iter() {
            if !std::ptr::eq(thread, me) {
                self.platform
                    .thread_roots(thread, &mut |start, end| scan(RootKind::Stack, start, end));
            }
            self.platform
                .thread_tls(thread, &mut |start, end| scan(RootKind::Tls, start, end));
            if let Some(token) = thread.tls_token() {
                self.tls_gc
                    .scan(token, &mut |start, end| scan(RootKind::Tls, start, end));
            }
        }
    }
}
