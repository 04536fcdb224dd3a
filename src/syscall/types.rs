use crate::scheduler::Pid;

/// Request codes carried in `rax`.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallId {
    /// Duplicate the calling task.
    Fork = 1,
    /// Block until a task has finished.
    WaitPid = 2,
    /// Restart the calling task at a new entry point.
    Exec = 3,
    /// Append a NUL-terminated string to the console.
    Write = 4,
    /// Finish the calling task.
    Exit = 5,
    /// Id of the calling task.
    GetPid = 6,
}

impl SyscallId {
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            1 => Some(Self::Fork),
            2 => Some(Self::WaitPid),
            3 => Some(Self::Exec),
            4 => Some(Self::Write),
            5 => Some(Self::Exit),
            6 => Some(Self::GetPid),
            _ => None,
        }
    }
}

/// Unknown syscall number.
pub const SYSCALL_ERR_UNSUPPORTED: u64 = u64::MAX;

/// Invalid argument for a known syscall.
pub const SYSCALL_ERR_INVALID_ARG: u64 = u64::MAX - 1;

/// Successful return code for void-like operations.
pub const SYSCALL_OK: u64 = 0;

/// `fork` result when no child could be created (-1).
pub const SYSCALL_FORK_FAILED: u64 = u64::MAX;

/// `waitpid` result once the target has finished.
pub const SYSCALL_WAIT_OK: u64 = 1;

/// `waitpid` result for a pid that is not in the task table.
pub const SYSCALL_WAIT_UNKNOWN: u64 = 0;

/// Task-facing syscall error space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    UnsupportedSyscall,
    InvalidArgument,
    /// `fork` could not create a child (table full or out of memory).
    ForkFailed,
    /// A value the request can never legitimately produce.
    Unknown(u64),
}

/// Splits a raw `rax` result into a value or one of the shared error
/// sentinels.
#[inline]
pub fn decode_result(raw: u64) -> Result<u64, SysError> {
    match raw {
        SYSCALL_ERR_UNSUPPORTED => Err(SysError::UnsupportedSyscall),
        SYSCALL_ERR_INVALID_ARG => Err(SysError::InvalidArgument),
        value => Ok(value),
    }
}

/// [`decode_result`] for results carrying a task id.
#[inline]
pub fn decode_pid(raw: u64) -> Result<Pid, SysError> {
    decode_result(raw).and_then(|value| Pid::try_from(value).map_err(|_| SysError::Unknown(value)))
}
