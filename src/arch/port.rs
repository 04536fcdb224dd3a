//! Byte-sized x86 port I/O used by the PIC, PIT, serial and VGA cursor code.

use core::arch::asm;

/// Typed handle for one 8-bit I/O port.
#[derive(Debug, Clone, Copy)]
pub struct PortByte {
    port: u16,
}

impl PortByte {
    pub const fn new(port: u16) -> Self {
        Self { port }
    }

    /// Reads one byte (`in al, dx`).
    ///
    /// # Safety
    /// Port reads can have device side effects (e.g. clearing status bits).
    #[inline]
    pub unsafe fn read(&self) -> u8 {
        let value: u8;
        asm!(
            "in al, dx",
            out("al") value,
            in("dx") self.port,
            options(nomem, nostack, preserves_flags)
        );
        value
    }

    /// Writes one byte (`out dx, al`).
    ///
    /// # Safety
    /// The caller must know what the device behind `port` does with `value`.
    #[inline]
    pub unsafe fn write(&self, value: u8) {
        asm!(
            "out dx, al",
            in("dx") self.port,
            in("al") value,
            options(nomem, nostack, preserves_flags)
        );
    }
}
