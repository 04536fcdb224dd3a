//! Per-target kernel logging.
//!
//! Every line goes to COM1. While capture is enabled, lines are also kept in a
//! fixed in-memory buffer as `target|message` records that tests and the
//! console dump read back. Targets in use: `sched`, `heap`, `console` and
//! `syscall`.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write};

use crate::drivers::screen::{Color, Screen};
use crate::drivers::serial;
use crate::sync::spinlock::SpinLock;

const CAPTURE_CAPACITY: usize = 16 * 1024;

struct Capture {
    enabled: bool,
    truncated: bool,
    len: usize,
    bytes: [u8; CAPTURE_CAPACITY],
}

impl Capture {
    fn reset(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.truncated = false;
        self.len = 0;
    }

    fn record(&mut self, target: &str, args: fmt::Arguments<'_>) {
        let _ = writeln!(self, "{}|{}", target, args);
    }

    /// Messages logged for `target`. A record cut off at the end of the
    /// buffer is dropped if the cut split a UTF-8 sequence.
    fn lines<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let bytes = &self.bytes[..self.len];
        let text = core::str::from_utf8(bytes).unwrap_or_else(|err| {
            // SAFETY: `valid_up_to` marks the end of the valid prefix.
            unsafe { core::str::from_utf8_unchecked(&bytes[..err.valid_up_to()]) }
        });
        text.lines().filter_map(move |record| {
            record
                .split_once('|')
                .filter(|(record_target, _)| *record_target == target)
                .map(|(_, message)| message)
        })
    }
}

impl Write for Capture {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let free = &mut self.bytes[self.len..];
        let n = free.len().min(s.len());
        free[..n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        self.truncated |= n < s.len();
        Ok(())
    }
}

static CAPTURE: SpinLock<Capture> = SpinLock::new(Capture {
    enabled: false,
    truncated: false,
    len: 0,
    bytes: [0; CAPTURE_CAPACITY],
});

/// Logs one line to serial and, while enabled, to the capture.
pub fn logln(target: &str, args: fmt::Arguments<'_>) {
    logln_with_options(target, args, true, true);
}

/// [`logln`] with each sink switchable.
pub fn logln_with_options(target: &str, args: fmt::Arguments<'_>, serial: bool, capture: bool) {
    if serial {
        serial::_debug_print(format_args!("{}\n", args));
    }
    if !capture {
        return;
    }
    // Busy means we were re-entered from inside the logger; drop the line.
    if let Some(mut capture) = CAPTURE.try_lock() {
        if capture.enabled {
            capture.record(target, args);
        }
    }
}

/// Switches capture on or off. The buffer is emptied either way.
pub fn set_capture_enabled(enabled: bool) {
    CAPTURE.lock().reset(enabled);
}

pub fn is_capture_enabled() -> bool {
    CAPTURE.lock().enabled
}

pub fn captured_contains(target: &str, needle: &str) -> bool {
    CAPTURE.lock().lines(target).any(|message| message.contains(needle))
}

/// Owned copies of the captured messages of `target`, oldest first.
pub fn captured_target_lines(target: &str) -> Vec<String> {
    let mut lines = Vec::new();
    {
        let capture = CAPTURE.lock();
        lines.extend(capture.lines(target).map(String::from));
    }
    lines
}

/// Prints the captured messages of `target`, those matching `highlight` in
/// green.
pub fn print_captured_target(
    screen: &mut Screen,
    target: &str,
    mut highlight: impl FnMut(&str) -> bool,
) {
    let capture = CAPTURE.lock();
    if capture.len == 0 {
        return;
    }

    let _ = writeln!(screen, "\n--- {} log ---", target);
    for message in capture.lines(target) {
        let color = if highlight(message) { Color::LightGreen } else { Color::White };
        screen.set_color(color);
        let _ = writeln!(screen, "{}", message);
    }
    screen.set_color(Color::White);

    if capture.truncated {
        let _ = writeln!(screen, "[capture full, later lines dropped]");
    }
    let _ = writeln!(screen, "--- end {} log ---", target);
}
