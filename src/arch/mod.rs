//! x86_64 plumbing: descriptor tables, trap entry, port I/O and QEMU exit.

pub mod gdt;
pub mod interrupts;
pub mod pic;
pub mod port;
pub mod qemu;
