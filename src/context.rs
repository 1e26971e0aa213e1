//! Scannable stack ranges and the intrusive list that holds them.
//!
//! The list does no locking of its own. Every mutation happens with the
//! registry lock held and, for insertion, with no suspension in progress;
//! [`Threads`](crate::Threads) enforces both before calling in here.

use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    ptr::null,
    sync::atomic::{AtomicPtr, AtomicU8, Ordering},
};

use crate::base::stack::STACK_GROWS_DOWN;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ContextState {
    /// Never inserted, or reset after removal.
    Unlinked = 0,
    Linked = 1,
    /// Removed from the list. Its links still point into the list so that a
    /// traversal standing on it can move on.
    Detached = 2,
}

impl ContextState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Unlinked,
            1 => Self::Linked,
            _ => Self::Detached,
        }
    }
}

pub(crate) struct Links<T> {
    pub(crate) prev: *const T,
    pub(crate) next: *const T,
}

impl<T> Links<T> {
    pub(crate) const fn new() -> Self {
        Self {
            prev: null(),
            next: null(),
        }
    }

    pub(crate) fn is_null(&self) -> bool {
        self.prev.is_null() && self.next.is_null()
    }
}

/// A `{bottom, top}` address interval scanned conservatively for roots.
///
/// `bottom` is where the stack starts, `top` is where it currently ends; for a
/// downward growing stack `top <= bottom`. A range whose top equals its bottom
/// is empty and produces no scan callback.
pub struct StackContext {
    bottom: AtomicPtr<u8>,
    top: AtomicPtr<u8>,
    links: UnsafeCell<Links<StackContext>>,
    state: AtomicU8,
}

unsafe impl Send for StackContext {}
unsafe impl Sync for StackContext {}

impl StackContext {
    pub const fn new() -> Self {
        Self {
            bottom: AtomicPtr::new(std::ptr::null_mut()),
            top: AtomicPtr::new(std::ptr::null_mut()),
            links: UnsafeCell::new(Links::new()),
            state: AtomicU8::new(ContextState::Unlinked as u8),
        }
    }

    pub fn with_bounds(bottom: *mut u8, top: *mut u8) -> Self {
        let ctx = Self::new();
        ctx.set_bottom(bottom);
        ctx.set_top(top);
        ctx
    }

    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        self.bottom.load(Ordering::Acquire)
    }

    #[inline]
    pub fn top(&self) -> *mut u8 {
        self.top.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_bottom(&self, bottom: *mut u8) {
        self.bottom.store(bottom, Ordering::Release);
    }

    /// Records where the stack currently ends. Async-signal-safe.
    #[inline]
    pub fn set_top(&self, top: *mut u8) {
        self.top.store(top, Ordering::Release);
    }

    pub fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_linked(&self) -> bool {
        self.state() == ContextState::Linked
    }

    /// The `[start, end)` interval to scan, or `None` for an empty range.
    pub fn scan_range(&self) -> Option<(*mut u8, *mut u8)> {
        let bottom = self.bottom();
        let top = self.top();
        if bottom.is_null() || top.is_null() {
            return None;
        }

        let (start, end) = if STACK_GROWS_DOWN {
            (top, bottom)
        } else {
            (bottom, top)
        };

        if start >= end {
            None
        } else {
            Some((start, end))
        }
    }

    /// Makes a detached context insertable again.
    ///
    /// # Safety
    ///
    /// No traversal of the list this context was removed from may still be
    /// standing on it.
    pub unsafe fn reset(&self) {
        assert!(
            !self.is_linked(),
            "cannot reset a stack context that is still linked"
        );
        *self.links.get() = Links::new();
        self.state
            .store(ContextState::Unlinked as u8, Ordering::Release);
    }

    #[inline]
    fn next(&self) -> *const StackContext {
        unsafe { (*self.links.get()).next }
    }
}

impl Default for StackContext {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for StackContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StackContext")
            .field("bottom", &self.bottom())
            .field("top", &self.top())
            .field("state", &self.state())
            .finish()
    }
}

/// Intrusive doubly-linked list of stack contexts, newest first.
pub(crate) struct ContextList {
    head: *const StackContext,
    len: usize,
}

impl ContextList {
    pub(crate) const fn new() -> Self {
        Self {
            head: null(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Inserts `ctx` at the head.
    ///
    /// # Safety
    ///
    /// The registry lock must be held and `ctx` must stay at its address until
    /// it is removed.
    pub(crate) unsafe fn add(&mut self, ctx: &StackContext) {
        assert!(
            ctx.state() == ContextState::Unlinked && (*ctx.links.get()).is_null(),
            "stack context {:p} is already linked",
            ctx
        );

        let links = &mut *ctx.links.get();
        links.next = self.head;
        if !self.head.is_null() {
            (*(*self.head).links.get()).prev = ctx;
        }
        self.head = ctx;
        self.len += 1;
        ctx.state.store(ContextState::Linked as u8, Ordering::Release);
    }

    /// Unlinks `ctx`, leaving its own links untouched. Returns false without
    /// doing anything if `ctx` is not currently linked.
    ///
    /// # Safety
    ///
    /// The registry lock must be held.
    pub(crate) unsafe fn remove(&mut self, ctx: &StackContext) -> bool {
        if !ctx.is_linked() {
            return false;
        }

        let links = &*ctx.links.get();
        if !links.prev.is_null() {
            (*(*links.prev).links.get()).next = links.next;
        }
        if !links.next.is_null() {
            (*(*links.next).links.get()).prev = links.prev;
        }
        if self.head == ctx as *const StackContext {
            self.head = links.next;
        }
        self.len -= 1;
        ctx.state
            .store(ContextState::Detached as u8, Ordering::Release);
        true
    }

    /// Detaches every context. Used at teardown.
    pub(crate) unsafe fn clear(&mut self) -> usize {
        let mut cleared = 0;
        let mut node = self.head;
        while !node.is_null() {
            let next = (*node).next();
            (*node)
                .state
                .store(ContextState::Detached as u8, Ordering::Release);
            cleared += 1;
            node = next;
        }
        self.head = null();
        self.len = 0;
        cleared
    }

    pub(crate) fn iter(&self) -> ContextIter<'_> {
        ContextIter {
            node: self.head,
            marker: PhantomData,
        }
    }
}

pub(crate) struct ContextIter<'a> {
    node: *const StackContext,
    marker: PhantomData<&'a ContextList>,
}

impl<'a> Iterator for ContextIter<'a> {
    type Item = &'a StackContext;

    fn next(&mut self) -> Option<Self::Item> {
        if self.node.is_null() {
            return None;
        }

        let ctx = unsafe { &*self.node };
        self.node = ctx.next();
        Some(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &ContextList) -> Vec<*const StackContext> {
        list.iter().map(|c| c as *const StackContext).collect()
    }

    #[test]
    fn add_inserts_at_head() {
        let a = StackContext::new();
        let b = StackContext::new();
        let c = StackContext::new();
        let mut list = ContextList::new();
        unsafe {
            list.add(&a);
            list.add(&b);
            list.add(&c);
        }

        assert_eq!(list.len(), 3);
        assert_eq!(
            addrs(&list),
            vec![&c as *const _, &b as *const _, &a as *const _]
        );
        assert!(a.is_linked() && b.is_linked() && c.is_linked());
    }

    #[test]
    fn remove_splices_and_keeps_links() {
        let a = StackContext::new();
        let b = StackContext::new();
        let c = StackContext::new();
        let mut list = ContextList::new();
        unsafe {
            list.add(&a);
            list.add(&b);
            list.add(&c);

            assert!(list.remove(&b));
        }

        assert_eq!(addrs(&list), vec![&c as *const _, &a as *const _]);
        assert_eq!(b.state(), ContextState::Detached);
        // A traversal parked on `b` can still walk on to `a`.
        assert_eq!(b.next(), &a as *const _);

        unsafe {
            assert!(list.remove(&c));
        }
        assert_eq!(addrs(&list), vec![&a as *const _]);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn removing_twice_is_a_no_op() {
        let a = StackContext::new();
        let b = StackContext::new();
        let mut list = ContextList::new();
        unsafe {
            list.add(&a);
            list.add(&b);
            assert!(list.remove(&a));
            assert!(!list.remove(&a));
            assert!(!list.remove(&StackContext::new()));
        }
        assert_eq!(addrs(&list), vec![&b as *const _]);
        assert_eq!(list.len(), 1);
    }

    #[test]
    #[should_panic(expected = "already linked")]
    fn double_insert_is_fatal() {
        let a = StackContext::new();
        let mut list = ContextList::new();
        unsafe {
            list.add(&a);
            list.add(&a);
        }
    }

    #[test]
    #[should_panic(expected = "already linked")]
    fn detached_context_needs_reset_before_reinsert() {
        let a = StackContext::new();
        let b = StackContext::new();
        let mut list = ContextList::new();
        unsafe {
            list.add(&a);
            list.add(&b);
            list.remove(&b);
            list.add(&b);
        }
    }

    #[test]
    fn reset_allows_reinsert() {
        let a = StackContext::new();
        let b = StackContext::new();
        let mut list = ContextList::new();
        unsafe {
            list.add(&a);
            list.add(&b);
            list.remove(&b);
            b.reset();
            list.add(&b);
        }
        assert_eq!(addrs(&list), vec![&b as *const _, &a as *const _]);
    }

    #[test]
    fn empty_ranges_have_no_scan_range() {
        let mut buf = [0usize; 8];
        let lo = buf.as_mut_ptr().cast::<u8>();
        let hi = unsafe { buf.as_mut_ptr().add(8).cast::<u8>() };

        assert_eq!(StackContext::new().scan_range(), None);
        assert_eq!(StackContext::with_bounds(hi, hi).scan_range(), None);

        let (bottom, top) = if STACK_GROWS_DOWN { (hi, lo) } else { (lo, hi) };
        let ctx = StackContext::with_bounds(bottom, top);
        assert_eq!(ctx.scan_range(), Some((lo, hi)));
    }
}
