//! Per-thread auxiliary collector data ("TLS-GC"), e.g. append caches that
//! need special treatment during marking.
//!
//! The data itself belongs to an external collaborator implementing [`TlsGc`];
//! this crate only stores an opaque [`TlsToken`] per thread and routes the
//! scan and mark-processing requests to it. A thread without a token simply
//! has nothing to contribute.

use std::{ffi::c_void, ptr::NonNull};

use crate::{thread::ThreadHandle, threads::Threads};

/// Opaque per-thread token handed out by a [`TlsGc`] collaborator.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TlsToken(NonNull<c_void>);

unsafe impl Send for TlsToken {}
unsafe impl Sync for TlsToken {}

impl TlsToken {
    pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

pub trait TlsGc: Send + Sync {
    /// Creates the calling thread's token. `None` means there is nothing to
    /// track for this thread (yet).
    fn init(&self) -> Option<TlsToken>;

    fn destroy(&self, token: TlsToken);

    /// Reports every root range held by the token's data.
    fn scan(&self, token: TlsToken, scan: &mut dyn FnMut(*mut u8, *mut u8));

    /// Drops whatever the token's data holds for objects `is_marked` reports
    /// as dead in the cycle that just finished marking.
    fn process_marks(&self, token: TlsToken, is_marked: &dyn Fn(*mut u8) -> bool);
}

/// Collaborator for runtimes without auxiliary per-thread data.
#[derive(Clone, Copy, Default, Debug)]
pub struct NoTlsGc;

impl TlsGc for NoTlsGc {
    fn init(&self) -> Option<TlsToken> {
        None
    }

    fn destroy(&self, _token: TlsToken) {}

    fn scan(&self, _token: TlsToken, _scan: &mut dyn FnMut(*mut u8, *mut u8)) {}

    fn process_marks(&self, _token: TlsToken, _is_marked: &dyn Fn(*mut u8) -> bool) {}
}

impl Threads {
    /// Obtains a token for `handle` from the collaborator. Should run on the
    /// thread the handle is bound to. A `None` token is stored as such.
    pub fn init_tls(&self, handle: &ThreadHandle) {
        let token = self.tls_gc.init();
        let _guard = self.lock();
        let previous = handle.tls_token();
        assert!(
            previous.is_none(),
            "thread {} already has a TLS-GC token",
            handle.label()
        );
        handle.set_tls_token(token);
    }

    /// Releases the token of `handle`, which must have one.
    pub fn destroy_tls(&self, handle: &ThreadHandle) {
        let token = {
            let _guard = self.lock();
            let token = handle.tls_token();
            handle.set_tls_token(None);
            token
        };
        let token = token.unwrap_or_else(|| {
            panic!(
                "thread {} has no TLS-GC token to destroy",
                handle.label()
            )
        });
        self.tls_gc.destroy(token);
    }

    /// Like [`destroy_tls`](Self::destroy_tls) but does nothing if the token is
    /// already gone.
    pub fn destroy_tls_if_avail(&self, handle: &ThreadHandle) {
        if handle.tls_token().is_some() {
            self.destroy_tls(handle);
        }
    }

    /// Lets the collaborator reconcile every thread's auxiliary data with the
    /// final marks of this cycle. Must run after scanning and before resuming.
    pub fn process_gc_marks(&self, is_marked: &dyn Fn(*mut u8) -> bool) {
        assert!(
            self.is_suspended(),
            "process_gc_marks called while the world is running"
        );

        let inner = unsafe { self.inner() };
        for thread in inner.threads.iter() {
            if let Some(token) = thread.tls_token() {
                self.tls_gc.process_marks(token, is_marked);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use parking_lot::Mutex;

    use super::*;

    /// Token payload: a fake root range plus a cache of object addresses.
    pub(crate) struct MockTlsData {
        pub(crate) roots: [usize; 4],
        pub(crate) cache: Mutex<Vec<usize>>,
    }

    #[derive(Default)]
    pub(crate) struct MockTlsGc {
        pub(crate) live: AtomicUsize,
        pub(crate) destroyed: AtomicUsize,
        pub(crate) processed: AtomicUsize,
        /// When set, `init` reports that the token does not exist yet.
        pub(crate) refuse: std::sync::atomic::AtomicBool,
    }

    impl MockTlsGc {
        pub(crate) fn data(token: TlsToken) -> &'static MockTlsData {
            unsafe { &*token.as_ptr().cast::<MockTlsData>() }
        }
    }

    impl TlsGc for MockTlsGc {
        fn init(&self) -> Option<TlsToken> {
            if self.refuse.load(Ordering::Relaxed) {
                return None;
            }
            self.live.fetch_add(1, Ordering::Relaxed);
            let data = Box::new(MockTlsData {
                roots: [0; 4],
                cache: Mutex::new(vec![0x10, 0x20, 0x30]),
            });
            TlsToken::from_raw(Box::into_raw(data).cast())
        }

        fn destroy(&self, token: TlsToken) {
            self.live.fetch_sub(1, Ordering::Relaxed);
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            drop(unsafe { Box::from_raw(token.as_ptr().cast::<MockTlsData>()) });
        }

        fn scan(&self, token: TlsToken, scan: &mut dyn FnMut(*mut u8, *mut u8)) {
            let data = Self::data(token);
            let start = data.roots.as_ptr() as *mut u8;
            let end = unsafe { data.roots.as_ptr().add(data.roots.len()) } as *mut u8;
            scan(start, end);
        }

        fn process_marks(&self, token: TlsToken, is_marked: &dyn Fn(*mut u8) -> bool) {
            self.processed.fetch_add(1, Ordering::Relaxed);
            Self::data(token)
                .cache
                .lock()
                .retain(|addr| is_marked(*addr as *mut u8));
        }
    }

    /// Lets a test keep inspecting the collaborator it handed to a registry.
    pub(crate) struct SharedTls(pub(crate) Arc<MockTlsGc>);

    impl TlsGc for SharedTls {
        fn init(&self) -> Option<TlsToken> {
            self.0.init()
        }
        fn destroy(&self, token: TlsToken) {
            self.0.destroy(token)
        }
        fn scan(&self, token: TlsToken, scan: &mut dyn FnMut(*mut u8, *mut u8)) {
            self.0.scan(token, scan)
        }
        fn process_marks(&self, token: TlsToken, is_marked: &dyn Fn(*mut u8) -> bool) {
            self.0.process_marks(token, is_marked)
        }
    }
}
