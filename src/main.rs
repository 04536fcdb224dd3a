//! taskos kernel - main entry point
//!
//! The bootloader sets up long mode with the higher-half mapping and jumps
//! to `KernelMain`.

#![no_std]
#![no_main]

mod panic;

use taskos_kernel::arch::{gdt, interrupts};
use taskos_kernel::config::TIMER_HZ;
use taskos_kernel::debugln;
use taskos_kernel::drivers::screen::{self, Color};
use taskos_kernel::drivers::serial;
use taskos_kernel::memory::heap;
use taskos_kernel::scheduler::{self, demotasks};

/// Kernel entry point, called from the bootloader with the kernel size in RDI.
#[no_mangle]
#[link_section = ".text.boot"]
pub extern "C" fn KernelMain(kernel_size: u64) -> ! {
    serial::init();
    debugln!("taskos kernel starting...");
    debugln!("Kernel size: {} bytes", kernel_size);

    gdt::init();
    debugln!("GDT initialized");

    interrupts::init();
    debugln!("Interrupt subsystem initialized");

    let heap = heap::init(false);
    debugln!("Heap initialized ({} bytes)", heap.stats().total_bytes);

    interrupts::init_periodic_timer(TIMER_HZ);

    screen::with_screen(|screen| {
        screen.clear();
        screen.set_color(Color::LightGreen);
        screen.print_str("taskos - round-robin task scheduler\n");
        screen.set_color(Color::White);
    });

    // Interrupts stay off until the table is populated so the first tick
    // sees a consistent scheduler.
    scheduler::init(heap, gdt::selectors());
    demotasks::spawn_demo_tasks().expect("failed to spawn boot tasks");
    debugln!("Scheduler started with {} tasks", scheduler::task_count());

    interrupts::enable();
    idle_loop()
}

/// Resumed whenever no task is runnable.
fn idle_loop() -> ! {
    loop {
        // SAFETY:
        // - Ring 0 with interrupts enabled; `hlt` wakes on the next IRQ.
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
    }
}
