//! 80x25 VGA text console.
//!
//! Text memory is reached through the higher-half alias of physical
//! `0xB8000`. The kernel console is one [`Screen`] behind a spinlock, see
//! [`with_screen`]. The panic handler builds a private one.

use core::fmt;

use crate::arch::port::PortByte;
use crate::sync::spinlock::SpinLock;

pub const COLS: usize = 80;
pub const ROWS: usize = 25;

const TEXT_BUFFER: *mut u16 = 0xFFFF_8000_000B_8000 as *mut u16;
const CRTC_INDEX: PortByte = PortByte::new(0x3D4);
const CRTC_DATA: PortByte = PortByte::new(0x3D5);
const CRTC_CURSOR_HIGH: u8 = 0x0E;
const CRTC_CURSOR_LOW: u8 = 0x0F;

/// The VGA palette entries the kernel draws with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0x0,
    Blue = 0x1,
    Red = 0x4,
    LightGray = 0x7,
    LightGreen = 0xA,
    Yellow = 0xE,
    White = 0xF,
}

pub struct Screen {
    row: usize,
    col: usize,
    attribute: u8,
}

impl Default for Screen {
    fn default() -> Self {
        Self::new()
    }
}

static CONSOLE: SpinLock<Screen> = SpinLock::new(Screen::new());

/// Runs `f` on the shared console. IF stays clear meanwhile, so output is
/// never interleaved by a task switch.
pub fn with_screen<R>(f: impl FnOnce(&mut Screen) -> R) -> R {
    f(&mut CONSOLE.lock())
}

fn write_cell(index: usize, cell: u16) {
    debug_assert!(index < ROWS * COLS);
    // SAFETY: `index` lies inside the 80x25 text buffer.
    unsafe { TEXT_BUFFER.add(index).write_volatile(cell) };
}

fn read_cell(index: usize) -> u16 {
    // SAFETY: as in `write_cell`.
    unsafe { TEXT_BUFFER.add(index).read_volatile() }
}

impl Screen {
    pub const fn new() -> Self {
        Self {
            row: 0,
            col: 0,
            attribute: ((Color::Black as u8) << 4) | Color::White as u8,
        }
    }

    pub fn set_color(&mut self, foreground: Color) {
        self.attribute = (self.attribute & 0xF0) | foreground as u8;
    }

    pub fn set_colors(&mut self, foreground: Color, background: Color) {
        self.attribute = ((background as u8) << 4) | foreground as u8;
    }

    fn cell(&self, byte: u8) -> u16 {
        u16::from(self.attribute) << 8 | u16::from(byte)
    }

    pub fn clear(&mut self) {
        let blank = self.cell(b' ');
        (0..ROWS * COLS).for_each(|index| write_cell(index, blank));
        self.row = 0;
        self.col = 0;
        self.sync_cursor();
    }

    pub fn get_cursor(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    fn newline(&mut self) {
        self.col = 0;
        if self.row + 1 < ROWS {
            self.row += 1;
            return;
        }
        for index in COLS..ROWS * COLS {
            write_cell(index - COLS, read_cell(index));
        }
        let blank = self.cell(b' ');
        ((ROWS - 1) * COLS..ROWS * COLS).for_each(|index| write_cell(index, blank));
    }

    fn put(&mut self, byte: u8) {
        match byte {
            b'\n' => self.newline(),
            b'\r' => self.col = 0,
            b'\t' => {
                let stop = (self.col / 8 + 1) * 8;
                while self.col < stop.min(COLS) {
                    self.put(b' ');
                }
            }
            _ => {
                if self.col == COLS {
                    self.newline();
                }
                let shown = if byte == b' ' || byte.is_ascii_graphic() { byte } else { b'?' };
                write_cell(self.row * COLS + self.col, self.cell(shown));
                self.col += 1;
            }
        }
    }

    /// Prints raw bytes. Anything outside printable ASCII shows as `?`.
    pub fn print_bytes(&mut self, bytes: &[u8]) {
        bytes.iter().for_each(|&byte| self.put(byte));
        self.sync_cursor();
    }

    pub fn print_str(&mut self, s: &str) {
        self.print_bytes(s.as_bytes());
    }

    fn sync_cursor(&self) {
        let [low, high] = ((self.row * COLS + self.col.min(COLS - 1)) as u16).to_le_bytes();
        // SAFETY: CRTC index/data writes only move the hardware cursor.
        unsafe {
            CRTC_INDEX.write(CRTC_CURSOR_HIGH);
            CRTC_DATA.write(high);
            CRTC_INDEX.write(CRTC_CURSOR_LOW);
            CRTC_DATA.write(low);
        }
    }
}

impl fmt::Write for Screen {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.print_str(s);
        Ok(())
    }
}
