//! taskos kernel library
//!
//! Exposes the kernel subsystems to the kernel binary and to the
//! integration tests, each of which boots as its own kernel image.

#![no_std]
#![no_main]

extern crate alloc;

pub mod allocator;
pub mod arch;
pub mod config;
pub mod drivers;
pub mod logging;
pub mod memory;
pub mod scheduler;
pub mod sync;
pub mod syscall;
pub mod testing;
