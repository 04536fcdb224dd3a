//! Task-side syscall wrappers.
//!
//! All wrappers are `#[inline(always)]`: a forked child resumes right after
//! the `int 0x80` with a relocated `rsp`/`rbp`, which is only sound when the
//! trap sits in the frame of the calling task function itself.

use core::arch::asm;
use core::ffi::CStr;

use crate::scheduler::{Pid, TaskFn};

use super::{
    abi, decode_pid, decode_result, SysError, SyscallId, SYSCALL_FORK_FAILED, SYSCALL_WAIT_OK,
};

/// Duplicates the calling task.
///
/// Returns `Ok(0)` in the child and `Ok(child_pid)` in the parent.
#[inline(always)]
pub fn sys_fork() -> Result<Pid, SysError> {
    let raw_value = unsafe {
        // SAFETY:
        // - Kernel tasks run in ring 0 with the syscall gate installed.
        abi::syscall0(SyscallId::Fork as u64)
    };

    match raw_value {
        SYSCALL_FORK_FAILED => Err(SysError::ForkFailed),
        raw => decode_pid(raw),
    }
}

/// Blocks until task `pid` has finished.
///
/// Returns `false` when `pid` is not in the task table.
#[inline(always)]
pub fn sys_waitpid(pid: Pid) -> bool {
    let raw_value = unsafe {
        // SAFETY:
        // - Kernel tasks run in ring 0 with the syscall gate installed.
        abi::syscall1(SyscallId::WaitPid as u64, pid as u64)
    };
    raw_value == SYSCALL_WAIT_OK
}

/// Restarts the calling task at `entry` on an empty stack.
///
/// Only returns if the kernel rejected the request.
#[inline(always)]
pub fn sys_exec(entry: TaskFn) -> SysError {
    let raw_value = unsafe {
        // SAFETY:
        // - Kernel tasks run in ring 0 with the syscall gate installed.
        // - `entry` is a valid task entry function.
        abi::syscall1(SyscallId::Exec as u64, entry as usize as u64)
    };

    match decode_result(raw_value) {
        Err(err) => err,
        Ok(other) => SysError::Unknown(other),
    }
}

/// Appends `text` to the console.
#[inline(always)]
pub fn sys_write(text: &CStr) -> Result<(), SysError> {
    unsafe { sys_write_raw(text.as_ptr().cast()) }
}

/// Appends the NUL-terminated string at `text` to the console.
///
/// # Safety
/// - `text` must be null or readable up to its terminator.
#[inline(always)]
pub unsafe fn sys_write_raw(text: *const u8) -> Result<(), SysError> {
    let raw_value = unsafe {
        // SAFETY:
        // - Guaranteed by the caller.
        abi::syscall1(SyscallId::Write as u64, text as u64)
    };

    decode_result(raw_value).map(|_| ())
}

/// Id of the calling task, 0 outside any task.
#[inline(always)]
pub fn sys_getpid() -> Pid {
    let raw_value = unsafe {
        // SAFETY:
        // - Kernel tasks run in ring 0 with the syscall gate installed.
        abi::syscall0(SyscallId::GetPid as u64)
    };
    decode_pid(raw_value).unwrap_or(0)
}

/// Finishes the calling task.
#[inline(always)]
pub fn sys_exit() -> ! {
    let _ = unsafe {
        // SAFETY:
        // - Kernel tasks run in ring 0 with the syscall gate installed.
        abi::syscall0(SyscallId::Exit as u64)
    };
    unsafe {
        // SAFETY:
        // - Only reached if exit was raised outside a task.
        asm!(
            "2:",
            "pause",
            "jmp 2b",
            options(noreturn)
        );
    }
}
