//! Round-robin scheduler integration tests.
//!
//! Timer ticks are simulated by calling `on_timer_tick` with a bootstrap
//! snapshot on the test stack; interrupts stay disabled throughout.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(taskos_kernel::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::mem::size_of;
use core::panic::PanicInfo;
use taskos_kernel::arch::gdt;
use taskos_kernel::arch::interrupts::{self, RegisterSnapshot};
use taskos_kernel::config::MAX_TASKS;
use taskos_kernel::memory::heap::{self, Heap};
use taskos_kernel::scheduler::{self as sched, task, SchedulerError, TaskState};

#[no_mangle]
#[link_section = ".text.boot"]
pub extern "C" fn KernelMain(_kernel_size: u64) -> ! {
    taskos_kernel::drivers::serial::init();
    gdt::init();
    interrupts::init();
    heap::init(false);

    test_main();

    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    taskos_kernel::testing::test_panic_handler(info)
}

extern "C" fn dummy_task_a() {
    loop {
        core::hint::spin_loop();
    }
}

extern "C" fn dummy_task_b() {
    loop {
        core::hint::spin_loop();
    }
}

extern "C" fn dummy_task_c() {
    loop {
        core::hint::spin_loop();
    }
}

fn reset_scheduler() -> &'static Heap {
    let heap = heap::kernel_heap();
    sched::init(heap, gdt::selectors());
    heap
}

fn frame_of(pid: sched::Pid) -> *mut RegisterSnapshot {
    sched::task_snapshot_ptr(pid).expect("task should have a snapshot")
}

// Must stay first: every later test initializes the scheduler.
#[test_case]
fn test_spawn_before_init_fails() {
    assert!(!sched::is_initialized());
    assert_eq!(sched::spawn(dummy_task_a), Err(SchedulerError::NotInitialized));

    let mut bootstrap = RegisterSnapshot::default();
    let current = &mut bootstrap as *mut RegisterSnapshot;
    assert!(sched::on_timer_tick(current) == current);
}

#[test_case]
fn test_empty_table_tick_is_noop() {
    reset_scheduler();

    let mut bootstrap = RegisterSnapshot::default();
    let current = &mut bootstrap as *mut RegisterSnapshot;

    assert!(sched::on_timer_tick(current) == current, "empty tick must return its input");
    assert!(sched::on_timer_tick(current) == current);
    assert_eq!(sched::current_index(), None, "cursor must stay at the empty sentinel");
    assert_eq!(sched::task_count(), 0);
}

#[test_case]
fn test_scheduler_round_robin_pointer_sequence() {
    reset_scheduler();

    let task_a = sched::spawn(dummy_task_a).expect("task A should spawn");
    let task_b = sched::spawn(dummy_task_b).expect("task B should spawn");
    let task_c = sched::spawn(dummy_task_c).expect("task C should spawn");

    let frame_a = frame_of(task_a);
    let frame_b = frame_of(task_b);
    let frame_c = frame_of(task_c);

    let mut bootstrap = RegisterSnapshot::default();
    let mut current = &mut bootstrap as *mut RegisterSnapshot;

    current = sched::on_timer_tick(current);
    assert!(current == frame_a, "first timer tick should switch to task A");

    current = sched::on_timer_tick(current);
    assert!(current == frame_b, "second timer tick should switch to task B");

    current = sched::on_timer_tick(current);
    assert!(current == frame_c, "third timer tick should switch to task C");

    current = sched::on_timer_tick(current);
    assert!(current == frame_a, "fourth timer tick should wrap to task A");
}

/// N ready tasks, N ticks: every task exactly once, in creation order.
#[test_case]
fn test_round_robin_fairness() {
    const N: usize = 7;
    reset_scheduler();

    let mut pids = [0; N];
    for pid in pids.iter_mut() {
        *pid = sched::spawn(dummy_task_a).expect("spawn should succeed");
    }

    let mut bootstrap = RegisterSnapshot::default();
    let mut current = &mut bootstrap as *mut RegisterSnapshot;

    for round in 0..3 {
        for (idx, pid) in pids.iter().enumerate() {
            current = sched::on_timer_tick(current);
            assert_eq!(
                sched::get_pid(current),
                Some(*pid),
                "round {} slot {} visited out of order",
                round,
                idx
            );
            assert_eq!(sched::current_index(), Some(idx));
        }
    }
}

#[test_case]
fn test_preempted_snapshot_is_stored_back() {
    reset_scheduler();
    let task_a = sched::spawn(dummy_task_a).expect("task A should spawn");
    let _task_b = sched::spawn(dummy_task_b).expect("task B should spawn");

    let mut bootstrap = RegisterSnapshot::default();
    let mut current = &mut bootstrap as *mut RegisterSnapshot;
    current = sched::on_timer_tick(current);

    // Pretend task A ran and was interrupted deeper in its stack.
    let deeper = (current as usize - 64) as *mut RegisterSnapshot;
    // SAFETY:
    // - `deeper` lies inside task A's stack, below its initial snapshot.
    unsafe {
        deeper.write(RegisterSnapshot {
            rax: 0xAA,
            ..*current
        });
    }

    let next = sched::on_timer_tick(deeper);
    assert!(next != deeper, "tick should switch away from task A");
    assert!(frame_of(task_a) == deeper, "interrupted snapshot must be stored");
}

#[test_case]
fn test_initial_snapshot_defaults() {
    reset_scheduler();
    let pid = sched::spawn(dummy_task_a).expect("spawn should succeed");
    let frame = frame_of(pid);
    let (base, top) = sched::task_stack_bounds(pid).expect("task should have a stack");

    // SAFETY:
    // - `frame` is the saved snapshot of a task that never ran.
    let snap = unsafe { *frame };

    assert_eq!(snap.rip, dummy_task_a as usize as u64);
    assert_eq!(snap.rflags, 0x202, "IF and reserved bit 1");
    assert_eq!(snap.cs, gdt::KERNEL_CODE_SELECTOR as u64);
    assert_eq!(snap.ss, gdt::KERNEL_DATA_SELECTOR as u64);
    assert_eq!(snap.error_code, 0);
    for gpr in [
        snap.r15, snap.r14, snap.r13, snap.r12, snap.r11, snap.r10, snap.r9, snap.r8, snap.rdi,
        snap.rsi, snap.rbp, snap.rbx, snap.rdx, snap.rcx, snap.rax,
    ] {
        assert_eq!(gpr, 0, "general-purpose registers start zeroed");
    }

    let rsp = snap.rsp as usize;
    assert!(rsp > base && rsp < top, "rsp must lie in the task stack");
    assert_eq!(rsp % 16, 8, "entry rsp is 16-byte aligned minus one slot");
    assert_eq!(rsp, (top & !0xF) - 8);
    assert_eq!(frame as usize, rsp - size_of::<RegisterSnapshot>());

    // SAFETY: the return slot is inside the task stack.
    let return_slot = unsafe { *(rsp as *const u64) };
    assert_eq!(return_slot, task::return_trap_address(), "return slot must exit the task");
}

#[test_case]
fn test_spawn_allocates_distinct_task_frames() {
    reset_scheduler();

    let task_a = sched::spawn(dummy_task_a).expect("task A should spawn");
    let task_b = sched::spawn(dummy_task_b).expect("task B should spawn");
    let task_c = sched::spawn(dummy_task_c).expect("task C should spawn");

    assert!(task_a < task_b && task_b < task_c, "pids must increase monotonically");

    let frame_a = frame_of(task_a) as usize;
    let frame_b = frame_of(task_b) as usize;
    let frame_c = frame_of(task_c) as usize;

    assert!(frame_a != frame_b, "task A and B frames must differ");
    assert!(frame_b != frame_c, "task B and C frames must differ");
    assert!(frame_a != frame_c, "task A and C frames must differ");
}

#[test_case]
fn test_scheduler_capacity_limit() {
    reset_scheduler();

    for _ in 0..MAX_TASKS {
        sched::spawn(dummy_task_a).expect("spawn within capacity should succeed");
    }
    assert_eq!(sched::task_count(), MAX_TASKS);

    let err = sched::spawn(dummy_task_b).expect_err("spawn beyond capacity must fail");
    assert_eq!(err, SchedulerError::CapacityExceeded);
    assert_eq!(sched::task_count(), MAX_TASKS, "failed spawn must not mutate the table");

    reset_scheduler();
    assert_eq!(sched::task_count(), 0);
}

#[test_case]
fn test_add_task_accepts_prebuilt_task() {
    let heap = reset_scheduler();
    let task = sched::TaskBox::new(heap, dummy_task_a, gdt::selectors(), 0)
        .expect("task allocation should succeed");
    let expected = task.pid();

    assert_eq!(sched::add_task(task), Ok(expected));
    assert_eq!(sched::task_state(expected), Some(TaskState::Ready));
}

/// A finished task is reaped when the cursor reaches it and never comes back.
#[test_case]
fn test_finished_task_is_reaped() {
    let heap = reset_scheduler();
    let baseline = heap.stats().used_blocks;

    let task_a = sched::spawn(dummy_task_a).expect("task A should spawn");
    let task_b = sched::spawn(dummy_task_b).expect("task B should spawn");
    let task_c = sched::spawn(dummy_task_c).expect("task C should spawn");
    let frame_b = frame_of(task_b);
    let frame_c = frame_of(task_c);

    let mut bootstrap = RegisterSnapshot::default();
    let mut current = &mut bootstrap as *mut RegisterSnapshot;
    current = sched::on_timer_tick(current);
    assert_eq!(sched::get_pid(current), Some(task_a));

    current = sched::exit_task(current);
    assert!(current == frame_b, "exit should switch to the next task");
    assert_eq!(sched::task_state(task_a), Some(TaskState::Finished));
    assert_eq!(sched::task_count(), 3, "reaping waits for the cursor");

    current = sched::on_timer_tick(current);
    assert!(current == frame_c);

    current = sched::on_timer_tick(current);
    assert!(current == frame_b, "cursor must skip over the reaped slot");
    assert_eq!(sched::task_count(), 2);
    assert_eq!(sched::task_state(task_a), None);
    assert_eq!(sched::current_index(), Some(0), "table is compacted");

    for _ in 0..4 {
        current = sched::on_timer_tick(current);
        assert!(sched::get_pid(current) != Some(task_a), "reaped task must never reappear");
    }

    reset_scheduler();
    assert_eq!(heap.stats().used_blocks, baseline, "task storage must be released");
}

/// Exiting the last task resumes the idle context; the task's storage is
/// released only on the following pass.
#[test_case]
fn test_last_exit_returns_idle_snapshot() {
    let heap = reset_scheduler();
    let baseline = heap.stats().used_blocks;
    let pid = sched::spawn(dummy_task_a).expect("spawn should succeed");

    let mut bootstrap = RegisterSnapshot::default();
    let idle = &mut bootstrap as *mut RegisterSnapshot;
    let current = sched::on_timer_tick(idle);
    assert_eq!(sched::get_pid(current), Some(pid));

    let next = sched::exit_task(current);
    assert!(next == idle, "empty table must resume the idle snapshot");
    assert_eq!(sched::task_count(), 0);
    assert_eq!(sched::current_index(), None);
    assert!(
        heap.stats().used_blocks > baseline,
        "storage of the exiting task stays alive while its stack is in use"
    );

    assert!(sched::on_timer_tick(idle) == idle);
    assert_eq!(heap.stats().used_blocks, baseline, "deferred storage freed on next pass");
}

#[test_case]
fn test_exit_from_non_task_context_is_ignored() {
    reset_scheduler();
    let pid = sched::spawn(dummy_task_a).expect("spawn should succeed");

    let mut bootstrap = RegisterSnapshot::default();
    let current = &mut bootstrap as *mut RegisterSnapshot;
    assert!(sched::exit_task(current) == current);
    assert_eq!(sched::task_state(pid), Some(TaskState::Ready));
}

#[test_case]
fn test_tick_counter_advances() {
    reset_scheduler();
    sched::spawn(dummy_task_a).expect("spawn should succeed");

    let mut bootstrap = RegisterSnapshot::default();
    let mut current = &mut bootstrap as *mut RegisterSnapshot;
    let before = sched::tick_count();
    for _ in 0..5 {
        current = sched::on_timer_tick(current);
    }
    assert_eq!(sched::tick_count(), before + 5);
}
