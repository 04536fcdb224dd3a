//! Raw `int 0x80` sequences.
//!
//! The trap stub saves and restores every general-purpose register, so only
//! `rax` comes back changed. Unused argument registers are zeroed to keep
//! stale values out of the snapshot.

use core::arch::asm;

/// Executes a zero-argument syscall.
///
/// # Safety
/// - The IDT must route vector 0x80 to the syscall stub.
/// - For `fork`, the caller must not rely on stack addresses held in
///   registers other than `rsp`/`rbp` after returning in the child.
#[inline(always)]
pub unsafe fn syscall0(syscall_nr: u64) -> u64 {
    let mut ret = syscall_nr;

    // SAFETY:
    // - Guaranteed by the caller.
    unsafe {
        asm!(
            "int 0x80",
            inout("rax") ret,
            in("rdi") 0u64,
            in("rsi") 0u64,
            in("rdx") 0u64,
            in("r10") 0u64
        );
    }

    ret
}

/// Executes a one-argument syscall.
///
/// # Safety
/// - The IDT must route vector 0x80 to the syscall stub.
/// - `arg0` must satisfy the contract of `syscall_nr` (e.g. a readable
///   NUL-terminated string for `write`).
#[inline(always)]
pub unsafe fn syscall1(syscall_nr: u64, arg0: u64) -> u64 {
    let mut ret = syscall_nr;

    // SAFETY:
    // - Guaranteed by the caller.
    unsafe {
        asm!(
            "int 0x80",
            inout("rax") ret,
            in("rdi") arg0,
            in("rsi") 0u64,
            in("rdx") 0u64,
            in("r10") 0u64
        );
    }

    ret
}
