//! Boot workload: a CPU-bound task, a fork/wait task and a monitor.

use core::ffi::CStr;
use core::fmt::{self, Write};

use crate::syscall::user::{sys_exit, sys_fork, sys_getpid, sys_waitpid, sys_write};

use super::roundrobin::{
    exit_current_task, print_process_table, spawn, task_count, yield_now, SchedulerError,
};

const SUM_LIMIT: u64 = 1000;
const COLLATZ_CHILDREN: u64 = 4;
const MONITOR_YIELDS: usize = 64;

/// Fixed-size, always NUL-terminated text buffer for `sys_write`.
pub struct TextBuffer<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> TextBuffer<N> {
    pub const fn new() -> Self {
        Self { bytes: [0; N], len: 0 }
    }

    pub fn as_cstr(&self) -> &CStr {
        // `write_str` always leaves a NUL at `len`.
        CStr::from_bytes_until_nul(&self.bytes[..=self.len]).unwrap_or_default()
    }
}

impl<const N: usize> Default for TextBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for TextBuffer<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // Keep one byte for the terminator; excess text is cut.
        let room = N.saturating_sub(1).saturating_sub(self.len);
        let take = room.min(s.len());
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        self.bytes[self.len] = 0;
        if take < s.len() {
            Err(fmt::Error)
        } else {
            Ok(())
        }
    }
}

pub fn nested_sum(limit: u64) -> u64 {
    let mut sum = 0u64;
    for i in 0..limit {
        for j in 0..limit {
            sum = sum.wrapping_add(i * j);
        }
    }
    sum
}

pub fn collatz_next(n: u64) -> u64 {
    if n % 2 == 0 {
        n / 2
    } else {
        3 * n + 1
    }
}

/// Returns by falling off the end, which exits through the return trap.
pub extern "C" fn long_running_task() {
    let sum = nested_sum(SUM_LIMIT);
    let mut text = TextBuffer::<96>::new();
    let _ = writeln!(text, "[pid {}] Sum: {}", sys_getpid(), sum);
    let _ = sys_write(text.as_cstr());
}

#[inline(never)]
fn collatz_child(start: u64) -> ! {
    let mut text = TextBuffer::<256>::new();
    let _ = write!(text, "Collatz({}):", start);
    let mut n = start;
    loop {
        let _ = write!(text, " {}", n);
        if n <= 1 {
            break;
        }
        n = collatz_next(n);
    }
    let _ = writeln!(text);
    let _ = sys_write(text.as_cstr());
    sys_exit()
}

pub extern "C" fn collatz_task() {
    for i in 1..COLLATZ_CHILDREN {
        match sys_fork() {
            Ok(0) => collatz_child(i),
            Ok(child) => {
                sys_waitpid(child);
            }
            Err(_) => {
                let _ = sys_write(c"Collatz task: fork failed\n");
            }
        }
    }
    let _ = sys_write(c"Collatz task exiting\n");
    sys_exit()
}

pub extern "C" fn monitor_task() {
    loop {
        print_process_table();
        if task_count() <= 1 {
            break;
        }
        for _ in 0..MONITOR_YIELDS {
            yield_now();
        }
    }
    let _ = sys_write(c"Monitor task exiting\n");
    exit_current_task()
}

/// Spawns the boot workload in table order: sum, Collatz, monitor.
pub fn spawn_demo_tasks() -> Result<(), SchedulerError> {
    spawn(long_running_task)?;
    spawn(collatz_task)?;
    spawn(monitor_task)?;
    Ok(())
}
