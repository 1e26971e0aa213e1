use std::ptr::null;

/// True on every target this crate supports: the stack bottom (origin) is the
/// highest address and the stack top moves towards lower addresses.
pub const STACK_GROWS_DOWN: bool = cfg!(not(target_arch = "hppa"));

/// Number of machine words reserved for callee-saved registers in the
/// trampoline frame.
const SPILL_SLOTS: usize = 12;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StackBounds {
    /// Address the stack grows away from (the "bottom" of a stack range).
    pub origin: *mut u8,
    /// Furthest address the stack may grow to.
    pub bound: *mut u8,
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
impl StackBounds {
    pub unsafe fn new_thread_stack_bounds(thread: libc::pthread_t) -> Self {
        let origin = libc::pthread_get_stackaddr_np(thread).cast::<u8>();
        let size = libc::pthread_get_stacksize_np(thread);
        Self {
            origin,
            bound: origin.sub(size),
        }
    }

    pub fn current_thread_stack_bounds() -> Self {
        unsafe { Self::new_thread_stack_bounds(libc::pthread_self()) }
    }
}

#[cfg(all(unix, not(any(target_os = "macos", target_os = "ios"))))]
impl StackBounds {
    #[cfg(target_os = "openbsd")]
    unsafe fn new_thread_stack_bounds(thread: libc::pthread_t) -> Self {
        let mut stack: libc::stack_t = core::mem::MaybeUninit::zeroed().assume_init();
        libc::pthread_stackseg_np(thread, &mut stack);
        let origin = stack.ss_sp.cast::<u8>();
        Self {
            origin,
            bound: origin.sub(stack.ss_size),
        }
    }

    #[cfg(not(target_os = "openbsd"))]
    unsafe fn new_thread_stack_bounds(thread: libc::pthread_t) -> Self {
        let mut bound = core::ptr::null_mut::<libc::c_void>();
        let mut stack_size = 0;
        let mut sattr: libc::pthread_attr_t = core::mem::MaybeUninit::zeroed().assume_init();
        libc::pthread_attr_init(&mut sattr);
        #[cfg(any(target_os = "freebsd", target_os = "netbsd"))]
        {
            libc::pthread_attr_get_np(thread, &mut sattr);
        }
        #[cfg(not(any(target_os = "freebsd", target_os = "netbsd")))]
        {
            libc::pthread_getattr_np(thread, &mut sattr);
        }
        let rc = libc::pthread_attr_getstack(&sattr, &mut bound, &mut stack_size);
        libc::pthread_attr_destroy(&mut sattr);
        assert_eq!(rc, 0, "pthread_attr_getstack failed");
        let origin = bound.cast::<u8>().add(stack_size);
        Self {
            bound: bound.cast(),
            origin,
        }
    }

    pub fn current_thread_stack_bounds() -> Self {
        unsafe { Self::new_thread_stack_bounds(libc::pthread_self()) }
    }
}

#[cfg(windows)]
impl StackBounds {
    unsafe fn current_thread_stack_bounds_internal() -> Self {
        use winapi::um::memoryapi::*;
        use winapi::um::winnt::*;
        let mut stack_origin: MEMORY_BASIC_INFORMATION =
            core::mem::MaybeUninit::zeroed().assume_init();
        VirtualQuery(
            &mut stack_origin as *mut MEMORY_BASIC_INFORMATION as *mut _,
            &mut stack_origin,
            core::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        );

        let origin = stack_origin
            .BaseAddress
            .cast::<u8>()
            .add(stack_origin.RegionSize as _);
        // Reserved stack memory is laid out (high to low) as committed pages,
        // a guard page and uncommitted pages, all sharing one AllocationBase.
        let mut uncommitted_memory: MEMORY_BASIC_INFORMATION =
            core::mem::MaybeUninit::zeroed().assume_init();
        VirtualQuery(
            stack_origin.AllocationBase as *mut _,
            &mut uncommitted_memory,
            core::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        );
        let mut guard_page: MEMORY_BASIC_INFORMATION =
            core::mem::MaybeUninit::zeroed().assume_init();
        VirtualQuery(
            uncommitted_memory
                .BaseAddress
                .cast::<u8>()
                .add(uncommitted_memory.RegionSize as _)
                .cast(),
            &mut guard_page,
            core::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        );
        let end_of_stack = stack_origin.AllocationBase as *mut u8;
        let bound = end_of_stack.add(guard_page.RegionSize as _);
        Self { origin, bound }
    }

    pub fn current_thread_stack_bounds() -> Self {
        unsafe { Self::current_thread_stack_bounds_internal() }
    }
}

/// Bottom of the calling thread's stack.
pub fn current_stack_bottom() -> *mut u8 {
    StackBounds::current_thread_stack_bounds().origin
}

#[inline(never)]
pub fn approximate_stack_pointer() -> *const *const u8 {
    let mut x: *const *const u8 = null();
    x = &x as *const *const *const u8 as *const *const u8;
    std::hint::black_box(x)
}

/// Spills the callee-saved registers of the caller into a frame on the
/// current stack and invokes `f` with the address of that frame.
///
/// Every register value live in the caller is stored at or above the address
/// passed to `f` (for a downward growing stack), so scanning from it to the
/// stack bottom covers the whole register file.
#[inline(never)]
pub fn with_spilled_registers(f: &mut dyn FnMut(*mut u8)) {
    let mut regs = [0usize; SPILL_SLOTS];
    spill_callee_saved(&mut regs);
    let sp = if STACK_GROWS_DOWN {
        regs.as_mut_ptr().cast::<u8>()
    } else {
        unsafe { regs.as_mut_ptr().add(SPILL_SLOTS).cast::<u8>() }
    };
    f(sp);
    std::hint::black_box(&mut regs);
}

#[inline(always)]
fn spill_callee_saved(regs: &mut [usize; SPILL_SLOTS]) {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            unsafe {
                std::arch::asm!(
                    "mov [{0}], rbx",
                    "mov [{0} + 8], rbp",
                    "mov [{0} + 16], r12",
                    "mov [{0} + 24], r13",
                    "mov [{0} + 32], r14",
                    "mov [{0} + 40], r15",
                    "mov [{0} + 48], rdi",
                    "mov [{0} + 56], rsi",
                    in(reg) regs.as_mut_ptr(),
                    options(nostack, preserves_flags)
                );
            }
        } else if #[cfg(target_arch = "aarch64")] {
            unsafe {
                std::arch::asm!(
                    "stp x19, x20, [{0}]",
                    "stp x21, x22, [{0}, #16]",
                    "stp x23, x24, [{0}, #32]",
                    "stp x25, x26, [{0}, #48]",
                    "stp x27, x28, [{0}, #64]",
                    "stp x29, x30, [{0}, #80]",
                    in(reg) regs.as_mut_ptr(),
                    options(nostack, preserves_flags)
                );
            }
        } else {
            // Other targets rely on the call itself having spilled
            // everything live into the caller's frame.
            std::hint::black_box(regs);
        }
    }
}
