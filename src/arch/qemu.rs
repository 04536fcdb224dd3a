//! QEMU `isa-debug-exit` device.
//!
//! The test runner terminates the emulator through this port. QEMU has to be
//! started with `-device isa-debug-exit,iobase=0xf4,iosize=0x04`; it then
//! exits with status `(value << 1) | 1`, i.e. 33 for success and 35 for
//! failure.

use crate::arch::port::PortByte;

const QEMU_EXIT_PORT: u16 = 0xF4;

/// Values written to the debug-exit port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Leaves QEMU with `exit_code`. Halts forever when the device is absent.
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    // SAFETY:
    // - Port 0xF4 is only decoded by the QEMU debug-exit device.
    // - On hardware without that device the write is ignored.
    unsafe {
        PortByte::new(QEMU_EXIT_PORT).write(exit_code as u8);
    }

    loop {
        // SAFETY:
        // - Terminal halt loop; nothing runs after the exit request.
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack, preserves_flags));
        }
    }
}
