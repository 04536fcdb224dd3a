//! `int 0x80` syscall surface.
//!
//! The trap stub hands the caller's [`RegisterSnapshot`](crate::arch::interrupts::RegisterSnapshot)
//! to [`dispatch`], which reads the request code from `rax`, the argument
//! from `rdi`, and writes the result back into `rax`. Task-side wrappers live
//! in [`user`], the raw `int 0x80` sequences in [`abi`].

mod dispatch;
mod types;

pub mod abi;
pub mod user;

pub use dispatch::dispatch;

pub use types::{
    decode_pid, decode_result, SysError, SyscallId, SYSCALL_ERR_INVALID_ARG,
    SYSCALL_ERR_UNSUPPORTED, SYSCALL_FORK_FAILED, SYSCALL_OK, SYSCALL_WAIT_OK,
    SYSCALL_WAIT_UNKNOWN,
};
