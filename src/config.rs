//! Compile-time kernel configuration.

/// Capacity of the task table.
pub const MAX_TASKS: usize = 256;

/// Size of the private stack embedded in every task.
pub const TASK_STACK_SIZE: usize = 8 * 1024;

/// PIT frequency driving preemption.
pub const TIMER_HZ: u32 = 250;

/// Bytes reserved for the kernel heap arena.
///
/// Sized so a full task table fits alongside the scheduler's own allocations.
pub const KERNEL_HEAP_SIZE: usize = 3 * 1024 * 1024;

/// Longest NUL-terminated string accepted by the `write` syscall.
pub const WRITE_MAX_LEN: usize = 4096;

/// Whether the scheduler logs every task switch after `init`.
pub const TRACE_TASK_SWITCHES: bool = false;
