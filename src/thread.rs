use std::{
    cell::{Cell, UnsafeCell},
    ffi::c_void,
    marker::PhantomData,
    ptr::{null, null_mut},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    base::stack::approximate_stack_pointer,
    context::{Links, StackContext},
    tls::TlsToken,
};

thread_local! {
    static CURRENT: Cell<*const ThreadHandle> = const { Cell::new(null()) };
}

/// Handle bound to the calling thread, or null. Async-signal-safe.
#[inline]
pub(crate) fn current_handle() -> *const ThreadHandle {
    CURRENT.try_with(|current| current.get()).unwrap_or(null())
}

pub(crate) fn set_current_handle(handle: *const ThreadHandle) {
    CURRENT.with(|current| current.set(handle));
}

/// Mailbox the suspend signal handler uses to talk to the suspending thread.
#[cfg(unix)]
pub(crate) struct SignalMailbox {
    /// Acknowledgement counter of the backend that sent the last suspend
    /// signal.
    pub(crate) acks: AtomicPtr<AtomicUsize>,
    /// Bumped once per resume; a suspended thread waits for it to change.
    pub(crate) resumes: AtomicUsize,
}

/// GC-relevant state of one OS thread.
///
/// A handle must not move while it is pending, registered or bound to a
/// thread; the lifecycle glue keeps handles in an `Arc` for that reason.
pub struct ThreadHandle {
    links: UnsafeCell<Links<ThreadHandle>>,
    main: StackContext,
    /// Range the thread currently executes on. Null selects `main`.
    current: AtomicPtr<StackContext>,
    tls: AtomicPtr<c_void>,
    critical: AtomicBool,
    running: AtomicBool,
    os_thread: AtomicUsize,
    /// Address of the registry the handle is pending in or registered with.
    registry: AtomicUsize,
    #[cfg(unix)]
    pub(crate) mailbox: SignalMailbox,
    /// Integer registers captured while the thread is suspended.
    #[cfg(windows)]
    pub(crate) registers: UnsafeCell<[usize; 16]>,
    entry: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    stack_size: usize,
    name: Option<String>,
}

unsafe impl Send for ThreadHandle {}
unsafe impl Sync for ThreadHandle {}

impl ThreadHandle {
    /// Handle for a thread that will run `entry` once started.
    pub fn new<F>(entry: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut handle = Self::for_current();
        handle.entry = Mutex::new(Some(Box::new(entry)));
        handle
    }

    /// Handle without an entry point, for attaching an already running thread.
    pub fn for_current() -> Self {
        Self {
            links: UnsafeCell::new(Links::new()),
            main: StackContext::new(),
            current: AtomicPtr::new(null_mut()),
            tls: AtomicPtr::new(null_mut()),
            critical: AtomicBool::new(false),
            running: AtomicBool::new(false),
            os_thread: AtomicUsize::new(0),
            registry: AtomicUsize::new(0),
            #[cfg(unix)]
            mailbox: SignalMailbox {
                acks: AtomicPtr::new(null_mut()),
                resumes: AtomicUsize::new(0),
            },
            #[cfg(windows)]
            registers: UnsafeCell::new([0; 16]),
            entry: Mutex::new(None),
            stack_size: 0,
            name: None,
        }
    }

    /// Requested stack size in bytes; zero uses the platform default.
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn label(&self) -> &str {
        self.name().unwrap_or("<unnamed>")
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// True between the OS thread confirming it started and it finishing its
    /// entry point.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn in_critical_region(&self) -> bool {
        self.critical.load(Ordering::Acquire)
    }

    pub(crate) fn set_critical(&self, critical: bool) {
        self.critical.store(critical, Ordering::Release);
    }

    /// The thread's own stack range.
    pub fn primary_context(&self) -> &StackContext {
        &self.main
    }

    /// The range the thread is currently executing on.
    #[inline]
    pub fn current_context(&self) -> &StackContext {
        let current = self.current.load(Ordering::Acquire);
        if current.is_null() {
            &self.main
        } else {
            unsafe { &*current }
        }
    }

    /// Redirects the current range to a nested stack, e.g. right before
    /// switching onto a coroutine stack. The range being left keeps the
    /// caller's stack pointer as its top, so the frames below the switch
    /// point stay visible to scans.
    ///
    /// Call from the bound thread inside a critical region, so a suspension
    /// cannot publish a top into the wrong range halfway through the switch.
    ///
    /// # Safety
    ///
    /// `ctx` must outlive the redirection; call
    /// [`restore_primary_context`](Self::restore_primary_context) before it
    /// goes away.
    pub unsafe fn switch_context(&self, ctx: &StackContext) {
        debug_assert!(
            self.in_critical_region(),
            "switch_context outside a critical region"
        );
        self.publish_outgoing_top();
        self.current
            .store(ctx as *const StackContext as *mut StackContext, Ordering::Release);
    }

    /// Switches back to the primary range. Same calling rules as
    /// [`switch_context`](Self::switch_context); does nothing when the
    /// primary range is already current.
    pub fn restore_primary_context(&self) {
        if self.current.load(Ordering::Acquire).is_null() {
            return;
        }
        debug_assert!(
            self.in_critical_region(),
            "restore_primary_context outside a critical region"
        );
        self.publish_outgoing_top();
        self.current.store(null_mut(), Ordering::Release);
    }

    /// Forgets any redirection without publishing anything. Used when a
    /// handle is bound to a thread.
    pub(crate) fn reset_current_context(&self) {
        self.current.store(null_mut(), Ordering::Release);
    }

    #[inline(always)]
    fn publish_outgoing_top(&self) {
        let sp = approximate_stack_pointer() as *mut u8;
        self.current_context().set_top(sp);
    }

    /// The auxiliary TLS-GC token, if one has been set up.
    pub fn tls_token(&self) -> Option<TlsToken> {
        TlsToken::from_raw(self.tls.load(Ordering::Acquire))
    }

    pub(crate) fn set_tls_token(&self, token: Option<TlsToken>) {
        let raw = token.map_or(null_mut(), TlsToken::as_ptr);
        self.tls.store(raw, Ordering::Release);
    }

    /// Platform identifier of the bound OS thread; zero when unbound.
    pub fn os_thread(&self) -> usize {
        self.os_thread.load(Ordering::Acquire)
    }

    pub(crate) fn set_os_thread(&self, id: usize) {
        self.os_thread.store(id, Ordering::Release);
    }

    pub(crate) fn registry(&self) -> usize {
        self.registry.load(Ordering::Acquire)
    }

    pub(crate) fn set_registry(&self, registry: usize) {
        self.registry.store(registry, Ordering::Release);
    }

    pub(crate) fn take_entry(&self) -> Option<Box<dyn FnOnce() + Send>> {
        self.entry.lock().take()
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn links(&self) -> &mut Links<ThreadHandle> {
        &mut *self.links.get()
    }
}

impl core::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("critical", &self.in_critical_region())
            .field("stack_size", &self.stack_size)
            .field("main", &self.main)
            .finish()
    }
}

/// Intrusive doubly-linked list of registered threads, newest first.
pub(crate) struct ThreadList {
    head: *const ThreadHandle,
    len: usize,
}

impl ThreadList {
    pub(crate) const fn new() -> Self {
        Self {
            head: null(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn head(&self) -> *const ThreadHandle {
        self.head
    }

    /// True if `handle` is linked into this list.
    pub(crate) fn contains(&self, handle: &ThreadHandle) -> bool {
        unsafe { !handle.links().is_null() || self.head == handle as *const ThreadHandle }
    }

    /// # Safety
    ///
    /// The registry lock must be held and `handle` must not be linked.
    pub(crate) unsafe fn push_front(&mut self, handle: &ThreadHandle) {
        assert!(
            handle.links().is_null() && self.head != handle as *const ThreadHandle,
            "thread handle {:p} is already registered",
            handle
        );

        let links = handle.links();
        links.next = self.head;
        if !self.head.is_null() {
            (*self.head).links().prev = handle;
        }
        self.head = handle;
        self.len += 1;
    }

    /// Splices `handle` out and clears its links. Returns false if it was not
    /// linked.
    ///
    /// # Safety
    ///
    /// The registry lock must be held.
    pub(crate) unsafe fn remove(&mut self, handle: &ThreadHandle) -> bool {
        if !self.contains(handle) {
            return false;
        }

        let links = handle.links();
        if !links.prev.is_null() {
            (*links.prev).links().next = links.next;
        }
        if !links.next.is_null() {
            (*links.next).links().prev = links.prev;
        }
        if self.head == handle as *const ThreadHandle {
            self.head = links.next;
        }
        *links = Links::new();
        self.len -= 1;
        true
    }

    /// Unlinks every handle. Used at teardown.
    pub(crate) unsafe fn clear(&mut self) -> usize {
        let mut cleared = 0;
        let mut node = self.head;
        while !node.is_null() {
            let next = (*node).links().next;
            *(*node).links() = Links::new();
            cleared += 1;
            node = next;
        }
        self.head = null();
        self.len = 0;
        cleared
    }

    pub(crate) fn iter(&self) -> ThreadIter<'_> {
        ThreadIter {
            node: self.head,
            marker: PhantomData,
        }
    }
}

/// Iterator over registered threads. The successor is read before a handle is
/// yielded, so the yielded handle may be removed from the list.
pub(crate) struct ThreadIter<'a> {
    node: *const ThreadHandle,
    marker: PhantomData<&'a ThreadList>,
}

impl<'a> Iterator for ThreadIter<'a> {
    type Item = &'a ThreadHandle;

    fn next(&mut self) -> Option<Self::Item> {
        if self.node.is_null() {
            return None;
        }

        let handle = unsafe { &*self.node };
        self.node = unsafe { handle.links().next };
        Some(handle)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn order(list: &ThreadList) -> Vec<*const ThreadHandle> {
        list.iter().map(|t| t as *const ThreadHandle).collect()
    }

    #[test]
    fn push_front_orders_newest_first() {
        let a = ThreadHandle::for_current();
        let b = ThreadHandle::for_current();
        let c = ThreadHandle::for_current();
        let mut list = ThreadList::new();
        unsafe {
            list.push_front(&a);
            list.push_front(&b);
            list.push_front(&c);
        }
        assert_eq!(order(&list), vec![&c as *const _, &b as *const _, &a as *const _]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn remove_is_idempotent() {
        let a = ThreadHandle::for_current();
        let b = ThreadHandle::for_current();
        let mut list = ThreadList::new();
        unsafe {
            list.push_front(&a);
            list.push_front(&b);
            assert!(list.remove(&a));
            assert!(!list.remove(&a));
            assert!(list.remove(&b));
            assert!(!list.remove(&b));
        }
        assert_eq!(list.len(), 0);
        assert!(list.head().is_null());
    }

    #[test]
    fn sole_head_with_null_links_is_still_removed() {
        let a = ThreadHandle::for_current();
        let mut list = ThreadList::new();
        unsafe {
            list.push_front(&a);
            assert!(a.links().is_null());
            assert!(list.contains(&a));
            assert!(list.remove(&a));
        }
        assert!(!list.contains(&a));
    }

    #[test]
    fn add_then_remove_restores_previous_state() {
        let a = ThreadHandle::for_current();
        let b = ThreadHandle::for_current();
        let x = ThreadHandle::for_current();
        let mut list = ThreadList::new();
        unsafe {
            list.push_front(&a);
            list.push_front(&b);
            let before = order(&list);

            list.push_front(&x);
            list.remove(&x);

            assert_eq!(order(&list), before);
            assert_eq!(list.len(), 2);
            assert!(b.links().prev.is_null());
        }
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn double_push_is_fatal() {
        let a = ThreadHandle::for_current();
        let mut list = ThreadList::new();
        unsafe {
            list.push_front(&a);
            list.push_front(&a);
        }
    }

    #[test]
    fn count_matches_reachable_nodes() {
        let handles = (0..16).map(|_| ThreadHandle::for_current()).collect::<Vec<_>>();
        let mut linked = vec![false; handles.len()];
        let mut list = ThreadList::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..2000 {
            let i = rng.gen_range(0..handles.len());
            unsafe {
                if linked[i] {
                    assert!(list.remove(&handles[i]));
                } else {
                    list.push_front(&handles[i]);
                }
            }
            linked[i] = !linked[i];

            assert_eq!(list.len(), list.iter().count());
            assert_eq!(list.len(), linked.iter().filter(|l| **l).count());
            for (handle, linked) in handles.iter().zip(linked.iter()) {
                assert_eq!(list.contains(handle), *linked);
            }
        }
    }

    #[test]
    fn current_context_follows_switches() {
        let handle = ThreadHandle::for_current();
        let nested = StackContext::new();
        handle.set_critical(true);
        assert!(std::ptr::eq(handle.current_context(), handle.primary_context()));

        unsafe { handle.switch_context(&nested) };
        assert!(std::ptr::eq(handle.current_context(), &nested));

        handle.restore_primary_context();
        assert!(std::ptr::eq(handle.current_context(), handle.primary_context()));
    }

    #[test]
    fn switching_publishes_the_outgoing_top() {
        let handle = ThreadHandle::for_current();
        let main = handle.primary_context();
        let bottom = crate::base::stack::current_stack_bottom();
        main.set_bottom(bottom);
        main.set_top(bottom);
        let local = 0usize;
        let local = std::hint::black_box(&local) as *const usize as *mut u8;

        let mut nested_stack = [0usize; 32];
        let nested_bottom = unsafe { nested_stack.as_mut_ptr().add(32).cast::<u8>() };
        let nested = StackContext::with_bounds(nested_bottom, nested_bottom);

        handle.set_critical(true);
        unsafe { handle.switch_context(&nested) };
        let (start, end) = main.scan_range().unwrap();
        assert!(start <= local && local < end);

        handle.restore_primary_context();
        assert!(std::ptr::eq(handle.current_context(), main));
        // Already primary: nothing to publish.
        let top = main.top();
        handle.restore_primary_context();
        assert_eq!(main.top(), top);
    }
}
