//! Harness for the bootable test kernels under `tests/`.
//!
//! Each test binary boots its own `KernelMain`, brings up what it needs and
//! then calls the generated `test_main()`. Results are written to COM1 and the
//! exit status goes out through QEMU's `isa-debug-exit` port.

use crate::arch::qemu::{exit_qemu, QemuExitCode};
use crate::{debug, debugln};

pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        let name = core::any::type_name::<T>();
        // Drop the crate prefix; every case lives in the test binary's root.
        let name = name.split_once("::").map_or(name, |(_, rest)| rest);
        debug!("[TEST] {} ... ", name);
        self();
        debugln!("ok");
    }
}

/// `#[test_runner]` entry. A failing case panics and never returns here.
pub fn test_runner(tests: &[&dyn Testable]) {
    debugln!("[TEST] running {} cases", tests.len());
    tests.iter().for_each(|test| test.run());
    debugln!("[TEST] {} passed", tests.len());
    exit_qemu(QemuExitCode::Success);
}

pub fn test_panic_handler(info: &core::panic::PanicInfo) -> ! {
    debugln!("FAILED");
    match info.location() {
        Some(at) => debugln!("[TEST] panic at {}:{}: {}", at.file(), at.line(), info.message()),
        None => debugln!("[TEST] panic: {}", info.message()),
    }
    exit_qemu(QemuExitCode::Failed);
}
