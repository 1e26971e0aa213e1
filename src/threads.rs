//! The thread registry: which threads the collector must stop and scan, which
//! are about to start, and which stack ranges belong to them.
//!
//! All list state lives behind one reentrant lock. Suspending the world
//! acquires it and keeps it until the matching resume, so no thread can
//! register, deregister or start while the world is stopped, and nested
//! suspensions on the collecting thread do not deadlock.

use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    ptr::null,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use parking_lot::{lock_api::RawReentrantMutex, Mutex, RawMutex, RawThreadId};

use crate::{
    config::ThreadsConfig,
    context::{ContextList, ContextState, StackContext},
    error::{Error, Result},
    platform::{NativePlatform, Platform},
    suspend::StopReport,
    thread::{current_handle, set_current_handle, ThreadHandle, ThreadList},
    tls::{NoTlsGc, TlsGc},
};

type RegistryLock = RawReentrantMutex<RawMutex, RawThreadId>;

pub(crate) struct ThreadsInner {
    pub(crate) threads: ThreadList,
    pub(crate) contexts: ContextList,
    /// Handles whose OS thread was requested but has not registered yet. Its
    /// storage is scanned as a root range.
    pub(crate) pending: Vec<*const ThreadHandle>,
    /// Set while the outermost suspension has other threads stopped.
    pub(crate) stopped: Option<StopReport>,
}

impl ThreadsInner {
    fn pending_index(&self, handle: &ThreadHandle) -> Option<usize> {
        self.pending
            .iter()
            .position(|pending| *pending == handle as *const ThreadHandle)
    }
}

pub struct Threads {
    inner: UnsafeCell<ThreadsInner>,
    lock: RegistryLock,
    /// Held while suspend signals go out, so a thread cannot enter or leave
    /// a critical region halfway through.
    pub(crate) critical_lock: Mutex<()>,
    pub(crate) depth: AtomicUsize,
    /// Cleared until a second thread can exist; suspension is then only
    /// bookkeeping.
    pub(crate) multithreaded: AtomicBool,
    pub(crate) platform: Box<dyn Platform>,
    pub(crate) tls_gc: Box<dyn TlsGc>,
    config: ThreadsConfig,
}

unsafe impl Send for Threads {}
unsafe impl Sync for Threads {}

/// Releases the registry lock on drop.
pub(crate) struct RegistryGuard<'a> {
    threads: &'a Threads,
    marker: PhantomData<*mut ()>,
}

impl Drop for RegistryGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.threads.unlock_raw() }
    }
}

impl Threads {
    pub fn new(config: ThreadsConfig, platform: Box<dyn Platform>, tls_gc: Box<dyn TlsGc>) -> Self {
        log::debug!(
            target: "gc-threads",
            "creating thread registry on {} backend: {}",
            platform.name(),
            config
        );

        Self {
            inner: UnsafeCell::new(ThreadsInner {
                threads: ThreadList::new(),
                contexts: ContextList::new(),
                pending: Vec::with_capacity(config.pending_start_capacity),
                stopped: None,
            }),
            lock: RegistryLock::INIT,
            critical_lock: Mutex::new(()),
            depth: AtomicUsize::new(0),
            multithreaded: AtomicBool::new(false),
            platform,
            tls_gc,
            config,
        }
    }

    /// Registry on the OS backend without auxiliary TLS data.
    pub fn native(config: ThreadsConfig) -> Self {
        let platform = NativePlatform::new(&config);
        Self::new(config, Box::new(platform), Box::new(NoTlsGc))
    }

    pub fn config(&self) -> &ThreadsConfig {
        &self.config
    }

    pub fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    pub(crate) fn lock(&self) -> RegistryGuard<'_> {
        self.lock_raw();
        RegistryGuard {
            threads: self,
            marker: PhantomData,
        }
    }

    pub(crate) fn lock_raw(&self) {
        self.lock.lock();
    }

    /// # Safety
    ///
    /// The calling thread must hold the registry lock.
    pub(crate) unsafe fn unlock_raw(&self) {
        self.lock.unlock();
    }

    /// # Safety
    ///
    /// The registry lock must be held by the calling thread, or the world must
    /// be suspended by it.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn inner(&self) -> &mut ThreadsInner {
        &mut *self.inner.get()
    }

    fn id(&self) -> usize {
        self as *const Self as usize
    }

    fn owns(&self, handle: &ThreadHandle) -> bool {
        handle.registry() == self.id()
    }

    /// Records that an OS thread for `handle` is about to be created. From
    /// here on suspension is no longer bookkeeping only, and the handle is
    /// kept reachable through the pending-start buffer until it registers.
    ///
    /// # Safety
    ///
    /// `handle` must stay at its address until it is registered and
    /// deregistered, or unmarked.
    pub unsafe fn mark_about_to_start(&self, handle: &ThreadHandle) {
        let _guard = self.lock();
        assert_eq!(
            self.suspend_depth(),
            0,
            "cannot start a thread while the world is suspended"
        );
        assert!(
            handle.registry() == 0,
            "thread {} is already pending or registered",
            handle.label()
        );

        self.multithreaded.store(true, Ordering::Release);
        let inner = self.inner();
        if inner.pending.try_reserve(1).is_err() {
            panic!(
                "out of memory growing the pending-start buffer to {} entries",
                inner.pending.len() + 1
            );
        }
        inner.pending.push(handle);
        handle.set_registry(self.id());

        log::trace!(
            target: "gc-threads",
            "thread {} is about to start ({} pending)",
            handle.label(),
            inner.pending.len()
        );
    }

    /// Takes `handle` back out of the pending-start buffer after its OS
    /// thread failed to start. The handle must be pending.
    pub fn unmark_about_to_start(&self, handle: &ThreadHandle) {
        let _guard = self.lock();
        let inner = unsafe { self.inner() };
        self.take_pending(inner, handle);
        handle.set_registry(0);
    }

    fn take_pending(&self, inner: &mut ThreadsInner, handle: &ThreadHandle) {
        let index = inner.pending_index(handle).unwrap_or_else(|| {
            panic!(
                "thread {} is not in the pending-start buffer",
                handle.label()
            )
        });
        inner.pending.swap_remove(index);
        inner.pending.shrink_to(self.config.pending_start_capacity);
    }

    /// Links a running thread into the registry, taking it out of the
    /// pending-start buffer first when `remove_from_pending` is set. The
    /// handle's primary stack range is not touched; see
    /// [`register`](Self::register).
    ///
    /// # Safety
    ///
    /// `handle` must stay at its address until it is removed.
    pub unsafe fn add(&self, handle: &ThreadHandle, remove_from_pending: bool) {
        let _guard = self.lock();
        self.link(handle, remove_from_pending);
    }

    unsafe fn link(&self, handle: &ThreadHandle, remove_from_pending: bool) {
        assert_eq!(
            self.suspend_depth(),
            0,
            "cannot register a thread while the world is suspended"
        );
        assert!(
            handle.is_running(),
            "thread {} is registered before it started running",
            handle.label()
        );

        let inner = self.inner();
        assert!(
            !inner.threads.contains(handle),
            "thread {} is already registered",
            handle.label()
        );
        if remove_from_pending {
            self.take_pending(inner, handle);
        } else {
            assert!(
                handle.registry() == 0,
                "thread {} is pending or registered elsewhere",
                handle.label()
            );
        }

        inner.threads.push_front(handle);
        handle.set_registry(self.id());
        if inner.threads.len() > 1 {
            self.multithreaded.store(true, Ordering::Release);
        }

        log::trace!(
            target: "gc-threads",
            "registered thread {} ({} registered, {} pending)",
            handle.label(),
            inner.threads.len(),
            inner.pending.len()
        );
    }

    /// Unlinks `handle` and its primary stack range. Removing a thread that is
    /// not registered here, or that was already removed, does nothing and
    /// returns false.
    pub fn remove(&self, handle: &ThreadHandle) -> bool {
        let _guard = self.lock();
        if !self.owns(handle) {
            return false;
        }

        let inner = unsafe { self.inner() };
        if !inner.threads.contains(handle) {
            return false;
        }
        unsafe { self.unlink(inner, handle) };
        log::trace!(
            target: "gc-threads",
            "deregistered thread {} ({} registered)",
            handle.label(),
            inner.threads.len()
        );
        true
    }

    /// Lock held.
    pub(crate) unsafe fn unlink(&self, inner: &mut ThreadsInner, handle: &ThreadHandle) {
        inner.contexts.remove(handle.primary_context());
        inner.threads.remove(handle);
        handle.set_registry(0);
    }

    /// Adds `handle`'s primary stack range and links the thread under a single
    /// acquisition of the registry lock.
    ///
    /// # Safety
    ///
    /// Same as [`add`](Self::add).
    pub unsafe fn register(&self, handle: &ThreadHandle, remove_from_pending: bool) {
        let _guard = self.lock();
        self.link(handle, remove_from_pending);

        // Left detached by an earlier deregistration.
        let main = handle.primary_context();
        if main.state() == ContextState::Detached {
            main.reset();
        }
        self.inner().contexts.add(main);
    }

    pub fn deregister(&self, handle: &ThreadHandle) -> bool {
        self.remove(handle)
    }

    /// Links an extra stack range, e.g. a coroutine stack.
    ///
    /// # Safety
    ///
    /// `ctx` must stay at its address until it is removed.
    pub unsafe fn add_context(&self, ctx: &StackContext) {
        let _guard = self.lock();
        assert_eq!(
            self.suspend_depth(),
            0,
            "cannot add a stack context while the world is suspended"
        );
        self.inner().contexts.add(ctx);
    }

    /// Unlinks `ctx`. Returns false if it was not linked.
    pub fn remove_context(&self, ctx: &StackContext) -> bool {
        let _guard = self.lock();
        unsafe { self.inner().contexts.remove(ctx) }
    }

    /// Handle bound to the calling thread, if it belongs to this registry.
    pub fn current(&self) -> Option<&ThreadHandle> {
        let handle = current_handle();
        if handle.is_null() {
            return None;
        }
        let handle = unsafe { &*handle };
        self.owns(handle).then_some(handle)
    }

    pub fn is_registered(&self, handle: &ThreadHandle) -> bool {
        let _guard = self.lock();
        self.owns(handle) && unsafe { self.inner() }.threads.contains(handle)
    }

    pub fn is_pending(&self, handle: &ThreadHandle) -> bool {
        let _guard = self.lock();
        self.owns(handle) && unsafe { self.inner() }.pending_index(handle).is_some()
    }

    pub fn thread_count(&self) -> usize {
        let _guard = self.lock();
        unsafe { self.inner() }.threads.len()
    }

    pub fn pending_count(&self) -> usize {
        let _guard = self.lock();
        unsafe { self.inner() }.pending.len()
    }

    pub fn context_count(&self) -> usize {
        let _guard = self.lock();
        unsafe { self.inner() }.contexts.len()
    }

    /// Visits registered threads newest first, with the registry lock held.
    pub fn for_each_thread(&self, mut f: impl FnMut(&ThreadHandle)) {
        let _guard = self.lock();
        for thread in unsafe { self.inner() }.threads.iter() {
            f(thread);
        }
    }

    /// Binds `handle` to the calling OS thread and marks it running. The
    /// primary stack range becomes the (so far empty) span of the caller's
    /// stack.
    fn bind_current(&self, handle: &ThreadHandle) {
        assert!(
            current_handle().is_null(),
            "calling thread is already bound to a thread handle"
        );

        self.platform.bind_current(handle);
        let main = handle.primary_context();
        let bottom = self.platform.stack_bottom();
        main.set_bottom(bottom);
        main.set_top(bottom);
        handle.reset_current_context();

        set_current_handle(handle);
        handle.set_running(true);
    }

    fn unbind_current(&self, handle: &ThreadHandle) {
        set_current_handle(null());
        self.platform.unbind(handle);
    }

    /// Makes the calling, already running thread known to the collector.
    ///
    /// # Safety
    ///
    /// `handle` must stay at its address until
    /// [`detach_current`](Self::detach_current) returns.
    pub unsafe fn attach_current(&self, handle: &ThreadHandle) {
        self.bind_current(handle);
        self.register(handle, false);
        self.init_tls(handle);
    }

    /// Undoes [`attach_current`](Self::attach_current) for the calling thread.
    /// Does nothing if the thread is not attached.
    pub fn detach_current(&self) {
        if let Some(handle) = self.current() {
            self.retire_current(handle);
        }
    }

    fn retire_current(&self, handle: &ThreadHandle) {
        handle.set_running(false);
        self.destroy_tls_if_avail(handle);
        self.deregister(handle);
        self.unbind_current(handle);
    }

    /// Starts an OS thread running `handle`'s entry point.
    ///
    /// The handle is pending from now until the new thread registers itself,
    /// so it is never invisible to a concurrent suspension. If the OS refuses
    /// to create the thread, the pending mark is undone.
    pub fn start(self: &Arc<Self>, handle: Arc<ThreadHandle>) -> Result<JoinHandle<()>> {
        unsafe { self.mark_about_to_start(&handle) };

        let mut builder = std::thread::Builder::new();
        if handle.stack_size() != 0 {
            builder = builder.stack_size(handle.stack_size());
        }
        if let Some(name) = handle.name() {
            builder = builder.name(name.to_string());
        }

        let threads = self.clone();
        let thread = handle.clone();
        match builder.spawn(move || threads.run(&thread)) {
            Ok(join) => Ok(join),
            Err(err) => {
                log::error!(
                    target: "gc-threads",
                    "failed to start thread {}: {}",
                    handle.label(),
                    err
                );
                self.unmark_about_to_start(&handle);
                Err(Error::Spawn(err))
            }
        }
    }

    /// Shorthand for [`start`](Self::start) with a fresh, unnamed handle.
    pub fn spawn<F>(self: &Arc<Self>, f: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.start(Arc::new(ThreadHandle::new(f)))
    }

    fn run(&self, handle: &ThreadHandle) {
        self.bind_current(handle);
        unsafe { self.register(handle, true) };
        self.init_tls(handle);

        let entry = handle.take_entry();
        let result = catch_unwind(AssertUnwindSafe(|| {
            if let Some(entry) = entry {
                entry();
            }
        }));

        self.retire_current(handle);
        if let Err(payload) = result {
            resume_unwind(payload);
        }
    }

    /// Marks the calling thread as owning its published stack top, e.g.
    /// while it switches stacks. Suspension waits for the region to be
    /// entered or left completely.
    pub fn enter_critical_region(&self) {
        let handle = self.expect_current("enter_critical_region");
        let _critical = self.critical_lock.lock();
        handle.set_critical(true);
    }

    pub fn exit_critical_region(&self) {
        let handle = self.expect_current("exit_critical_region");
        let _critical = self.critical_lock.lock();
        handle.set_critical(false);
    }

    pub fn in_critical_region(&self) -> bool {
        self.expect_current("in_critical_region")
            .in_critical_region()
    }

    fn expect_current(&self, what: &str) -> &ThreadHandle {
        match self.current() {
            Some(handle) => handle,
            None => panic!("{} called from a thread not bound to this registry", what),
        }
    }

    /// Forgets every thread, context and pending start. Handles still alive
    /// become unlinked and may be registered again elsewhere.
    pub fn teardown(&self) {
        let _guard = self.lock();
        assert_eq!(
            self.suspend_depth(),
            0,
            "cannot tear down the registry while the world is suspended"
        );

        let inner = unsafe { self.inner() };
        for thread in inner.threads.iter() {
            thread.set_registry(0);
        }
        for pending in inner.pending.iter() {
            unsafe { (**pending).set_registry(0) };
        }
        let threads = unsafe { inner.threads.clear() };
        let contexts = unsafe { inner.contexts.clear() };
        let pending = inner.pending.len();
        inner.pending = Vec::new();

        if threads + contexts + pending != 0 {
            log::debug!(
                target: "gc-threads",
                "teardown dropped {} thread(s), {} context(s), {} pending start(s)",
                threads,
                contexts,
                pending
            );
        }
    }
}

impl Drop for Threads {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
impl Threads {
    /// Registers `handle` as if a thread bound to it were running, without
    /// touching the calling thread.
    pub(crate) unsafe fn attach_fake(&self, handle: &ThreadHandle) {
        self.platform.bind_current(handle);
        handle.set_running(true);
        self.register(handle, false);
    }
}
