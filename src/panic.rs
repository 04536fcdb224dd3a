//! Kernel panic handler: blue screen plus a serial copy, then halt.

use core::fmt::Write;
use core::panic::PanicInfo;

use taskos_kernel::debugln;
use taskos_kernel::drivers::screen::{Color, Screen};

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    debugln!("!!! KERNEL PANIC !!! {}", info);

    // A private writer: the shared console lock may be held by the code
    // that panicked.
    let mut screen = Screen::new();
    screen.set_colors(Color::White, Color::Blue);
    screen.clear();
    let _ = writeln!(screen, "\n!!! KERNEL PANIC !!!");

    if let Some(location) = info.location() {
        let _ = writeln!(screen, "Location: {}:{}", location.file(), location.line());
    }
    let _ = writeln!(screen, "Message: {}", info.message());

    loop {
        // SAFETY:
        // - Terminal halt loop.
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack, preserves_flags));
        }
    }
}
