//! Polled COM1 output for traces and test results.
//!
//! Start QEMU with `-serial stdio` to see it.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::port::PortByte;

/// 16550 UART driven by polling the line status register.
pub struct Uart {
    base: u16,
}

impl Uart {
    const DATA: u16 = 0;
    const IER: u16 = 1;
    const FCR: u16 = 2;
    const LCR: u16 = 3;
    const MCR: u16 = 4;
    const LSR: u16 = 5;

    const LSR_TX_EMPTY: u8 = 1 << 5;

    pub const fn new(base: u16) -> Self {
        Self { base }
    }

    fn port(&self, register: u16) -> PortByte {
        PortByte::new(self.base + register)
    }

    /// 115200 baud, 8N1, FIFOs on, UART interrupts off.
    pub fn init(&self) {
        let setup: [(u16, u8); 7] = [
            (Self::IER, 0x00),
            // DLAB on: DATA/IER become the divisor latch.
            (Self::LCR, 0x80),
            (Self::DATA, 0x01),
            (Self::IER, 0x00),
            (Self::LCR, 0x03),
            (Self::FCR, 0xC7),
            (Self::MCR, 0x0B),
        ];
        for (register, value) in setup {
            // SAFETY: only registers of this UART are written.
            unsafe { self.port(register).write(value) };
        }
    }

    pub fn send(&self, byte: u8) {
        // SAFETY: reading LSR does not disturb the data path.
        while unsafe { self.port(Self::LSR).read() } & Self::LSR_TX_EMPTY == 0 {
            core::hint::spin_loop();
        }
        // SAFETY: the transmit holding register is free.
        unsafe { self.port(Self::DATA).write(byte) };
    }

    /// Sends `bytes`, turning every LF into CRLF.
    pub fn send_all(&self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' {
                self.send(b'\r');
            }
            self.send(byte);
        }
    }
}

impl fmt::Write for &Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.send_all(s.as_bytes());
        Ok(())
    }
}

static COM1: Uart = Uart::new(0x3F8);
static READY: AtomicBool = AtomicBool::new(false);

/// Brings up COM1. Anything written before is discarded.
pub fn init() {
    COM1.init();
    READY.store(true, Ordering::Release);
}

pub fn is_initialized() -> bool {
    READY.load(Ordering::Acquire)
}

pub fn write_bytes(bytes: &[u8]) {
    if is_initialized() {
        COM1.send_all(bytes);
    }
}

#[doc(hidden)]
pub fn _debug_print(args: fmt::Arguments) {
    if is_initialized() {
        let _ = fmt::Write::write_fmt(&mut &COM1, args);
    }
}

/// `print!` to COM1.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::drivers::serial::_debug_print(format_args!($($arg)*))
    };
}

/// `println!` to COM1.
#[macro_export]
macro_rules! debugln {
    () => {
        $crate::debug!("\n")
    };
    ($($arg:tt)*) => {
        $crate::debug!("{}\n", format_args!($($arg)*))
    };
}
