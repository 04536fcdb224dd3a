//! Kernel-side syscall dispatcher (`int 0x80` path).
//!
//! ABI, read from and written to the trapped snapshot:
//! - `RAX` -> request code, then result
//! - `RDI` -> argument
//!
//! Only `waitpid` and `exit` hand back a snapshot other than the caller's.

use core::ptr;

use crate::arch::interrupts::RegisterSnapshot;
use crate::config::WRITE_MAX_LEN;
use crate::drivers::screen;
use crate::drivers::serial;
use crate::logging;
use crate::scheduler::{self, Pid};

use super::{
    SyscallId, SYSCALL_ERR_INVALID_ARG, SYSCALL_ERR_UNSUPPORTED, SYSCALL_FORK_FAILED, SYSCALL_OK,
    SYSCALL_WAIT_OK, SYSCALL_WAIT_UNKNOWN,
};

/// Handles the syscall trapped at `frame` and returns the snapshot to resume.
///
/// `frame` must point at a live snapshot built by the trap stub (or, in
/// tests, at any writable snapshot).
pub fn dispatch(frame: *mut RegisterSnapshot) -> *mut RegisterSnapshot {
    if frame.is_null() {
        return frame;
    }

    // SAFETY:
    // - `frame` is non-null and points at the caller's saved registers.
    // - Interrupts are masked on the syscall path; nothing else touches it.
    let (request, arg0) = unsafe { ((*frame).rax, (*frame).rdi) };

    match SyscallId::from_raw(request) {
        Some(SyscallId::Fork) => set_result(frame, syscall_fork_impl(frame)),
        Some(SyscallId::WaitPid) => return syscall_waitpid_impl(frame, arg0),
        Some(SyscallId::Exec) => set_result(frame, syscall_exec_impl(frame, arg0)),
        Some(SyscallId::Write) => set_result(frame, syscall_write_impl(arg0 as *const u8)),
        Some(SyscallId::Exit) => return scheduler::exit_task(frame),
        Some(SyscallId::GetPid) => {
            let pid = scheduler::get_pid(frame).unwrap_or(0);
            set_result(frame, pid as u64)
        }
        None => {
            logging::logln(
                "syscall",
                format_args!("[SYSCALL] unsupported request {}", request),
            );
            set_result(frame, SYSCALL_ERR_UNSUPPORTED)
        }
    }
    frame
}

fn set_result(frame: *mut RegisterSnapshot, value: u64) {
    // SAFETY: `frame` was validated by `dispatch`.
    unsafe {
        (*frame).rax = value;
    }
}

/// Child id in the parent; the child's copy already carries `rax == 0`.
fn syscall_fork_impl(frame: *mut RegisterSnapshot) -> u64 {
    match scheduler::fork_task(frame) {
        Ok(pid) => pid as u64,
        Err(err) => {
            logging::logln("syscall", format_args!("[SYSCALL] fork failed: {:?}", err));
            SYSCALL_FORK_FAILED
        }
    }
}

fn syscall_waitpid_impl(frame: *mut RegisterSnapshot, pid: u64) -> *mut RegisterSnapshot {
    let Ok(pid) = Pid::try_from(pid) else {
        set_result(frame, SYSCALL_WAIT_UNKNOWN);
        return frame;
    };

    // Stored before switching away: the waiter resumes from this snapshot.
    set_result(frame, SYSCALL_WAIT_OK);
    match scheduler::wait_task(frame, pid) {
        Ok(next) => next,
        Err(_) => {
            set_result(frame, SYSCALL_WAIT_UNKNOWN);
            frame
        }
    }
}

fn syscall_exec_impl(frame: *mut RegisterSnapshot, entry: u64) -> u64 {
    if entry == 0 {
        return SYSCALL_ERR_INVALID_ARG;
    }
    scheduler::exec_task(frame, entry).unwrap_or(SYSCALL_ERR_INVALID_ARG)
}

/// Length of the NUL-terminated string at `text`, capped at `WRITE_MAX_LEN`.
///
/// # Safety
/// - `text` must be readable up to its terminator or `WRITE_MAX_LEN` bytes.
unsafe fn bounded_strlen(text: *const u8) -> usize {
    let mut len = 0;
    // SAFETY: guaranteed by the caller.
    while len < WRITE_MAX_LEN && unsafe { ptr::read(text.add(len)) } != 0 {
        len += 1;
    }
    len
}

fn syscall_write_impl(text: *const u8) -> u64 {
    if text.is_null() {
        return SYSCALL_ERR_INVALID_ARG;
    }

    // SAFETY:
    // - Tasks share the kernel address space; the caller passes a string it
    //   owns, terminated within `WRITE_MAX_LEN` bytes or truncated there.
    let bytes = unsafe { core::slice::from_raw_parts(text, bounded_strlen(text)) };

    serial::write_bytes(bytes);
    screen::with_screen(|screen| screen.print_bytes(bytes));
    capture_console_lines(bytes);
    SYSCALL_OK
}

/// Mirrors written text into the `console` capture, one entry per line.
fn capture_console_lines(bytes: &[u8]) {
    for line in bytes.split(|&b| b == b'\n').filter(|line| !line.is_empty()) {
        let text = match core::str::from_utf8(line) {
            Ok(text) => text,
            Err(err) => core::str::from_utf8(&line[..err.valid_up_to()]).unwrap_or(""),
        };
        logging::logln_with_options("console", format_args!("{}", text), false, true);
    }
}
