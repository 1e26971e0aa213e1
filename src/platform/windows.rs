use std::{mem::MaybeUninit, ptr::null_mut};

use errno::{errno, Errno};
use winapi::{
    shared::minwindef::FALSE,
    um::{
        handleapi::{CloseHandle, DuplicateHandle},
        processthreadsapi::{
            GetCurrentProcess, GetCurrentThread, GetThreadContext, ResumeThread, SuspendThread,
        },
        winnt::{CONTEXT, CONTEXT_CONTROL, CONTEXT_INTEGER, DUPLICATE_SAME_ACCESS, HANDLE},
    },
};

use super::Platform;
use crate::{config::ThreadsConfig, thread::ThreadHandle};

/// Suspension through `SuspendThread`/`ResumeThread`. `GetThreadContext`
/// only returns once the target has actually stopped, so there is nothing to
/// wait for afterwards.
pub struct Win32Platform;

impl Win32Platform {
    pub fn new(_config: &ThreadsConfig) -> Self {
        Self
    }
}

impl Platform for Win32Platform {
    fn name(&self) -> &'static str {
        "win32"
    }

    fn bind_current(&self, thread: &ThreadHandle) {
        let mut handle: HANDLE = null_mut();
        unsafe {
            let process = GetCurrentProcess();
            if DuplicateHandle(
                process,
                GetCurrentThread(),
                process,
                &mut handle,
                0,
                FALSE,
                DUPLICATE_SAME_ACCESS,
            ) == 0
            {
                panic!("DuplicateHandle failed: {}", errno());
            }
        }
        thread.set_os_thread(handle as usize);
    }

    fn unbind(&self, thread: &ThreadHandle) {
        let handle = thread.os_thread();
        if handle != 0 {
            unsafe {
                CloseHandle(handle as HANDLE);
            }
            thread.set_os_thread(0);
        }
    }

    unsafe fn suspend(&self, thread: &ThreadHandle) -> Result<(), Errno> {
        let handle = thread.os_thread() as HANDLE;
        if SuspendThread(handle) == u32::MAX {
            return Err(errno());
        }

        let mut context: CONTEXT = MaybeUninit::zeroed().assume_init();
        context.ContextFlags = CONTEXT_CONTROL | CONTEXT_INTEGER;
        if GetThreadContext(handle, &mut context) == 0 {
            let err = errno();
            ResumeThread(handle);
            return Err(err);
        }

        if !thread.in_critical_region() {
            thread.current_context().set_top(context.Rsp as *mut u8);
        }

        *thread.registers.get() = [
            context.Rax as usize,
            context.Rbx as usize,
            context.Rcx as usize,
            context.Rdx as usize,
            context.Rdi as usize,
            context.Rsi as usize,
            context.Rbp as usize,
            context.Rsp as usize,
            context.R8 as usize,
            context.R9 as usize,
            context.R10 as usize,
            context.R11 as usize,
            context.R12 as usize,
            context.R13 as usize,
            context.R14 as usize,
            context.R15 as usize,
        ];
        Ok(())
    }

    fn wait_for_suspend(&self, _count: usize) -> bool {
        false
    }

    unsafe fn resume(&self, thread: &ThreadHandle) -> Result<(), Errno> {
        *thread.registers.get() = [0; 16];
        if ResumeThread(thread.os_thread() as HANDLE) == u32::MAX {
            return Err(errno());
        }
        Ok(())
    }

    fn thread_roots(&self, thread: &ThreadHandle, scan: &mut dyn FnMut(*mut u8, *mut u8)) {
        let registers = thread.registers.get().cast::<usize>();
        unsafe { scan(registers.cast(), registers.add(16).cast()) }
    }
}
