//! Fork, wait, exit and exec integration tests.
//!
//! Most tests drive the scheduler with simulated traps: a task's saved
//! snapshot is handed back in as if that task had just trapped. The last
//! two tests run on real timer interrupts and `int 0x80` traps.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(taskos_kernel::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;
use taskos_kernel::arch::gdt;
use taskos_kernel::arch::interrupts::{self, RegisterSnapshot};
use taskos_kernel::config::MAX_TASKS;
use taskos_kernel::logging;
use taskos_kernel::memory::heap;
use taskos_kernel::scheduler::{self as sched, demotasks, task, Pid, SchedulerError, TaskState};
use taskos_kernel::syscall::{self, user, SyscallId, SYSCALL_FORK_FAILED, SYSCALL_WAIT_OK};

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

extern "C" fn spinning_task() {
    loop {
        core::hint::spin_loop();
    }
}

extern "C" fn replacement_entry() {
    loop {
        core::hint::spin_loop();
    }
}

/// Exec target. Returning lands on the return trap, which exits the task.
extern "C" fn exec_target() {
    let _ = user::sys_write(c"exec target ran\n");
}

#[inline(never)]
fn exec_child() -> ! {
    let _ = user::sys_exec(exec_target);
    let _ = user::sys_write(c"exec returned\n");
    user::sys_exit()
}

/// Forks; the child replaces itself with `exec_target`, the parent waits.
extern "C" fn exec_parent() {
    match user::sys_fork() {
        Ok(0) => exec_child(),
        Ok(child) => {
            if user::sys_waitpid(child) {
                let _ = user::sys_write(c"exec child finished\n");
            }
        }
        Err(_) => {
            let _ = user::sys_write(c"fork failed\n");
        }
    }
}

/// Runs the scheduler on real timer ticks until every task has exited.
fn run_until_idle(tick_budget: u64) {
    let deadline = sched::tick_count() + tick_budget;
    interrupts::init_periodic_timer(250);
    interrupts::enable();
    while sched::task_count() > 0 && sched::tick_count() < deadline {
        // SAFETY: ring 0 with interrupts enabled.
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
    }
    interrupts::disable();
}

fn reset_scheduler() {
    sched::init(heap::kernel_heap(), gdt::selectors());
}

fn frame_of(pid: Pid) -> *mut RegisterSnapshot {
    sched::task_snapshot_ptr(pid).expect("task should have a snapshot")
}

fn snapshot(frame: *mut RegisterSnapshot) -> RegisterSnapshot {
    // SAFETY: test frames point at saved snapshots of suspended tasks.
    unsafe { *frame }
}

/// Simulates `int 0x80` from the context saved at `frame`.
fn trap(frame: *mut RegisterSnapshot, id: SyscallId, arg0: u64) -> *mut RegisterSnapshot {
    // SAFETY: see `snapshot`.
    unsafe {
        (*frame).rax = id as u64;
        (*frame).rdi = arg0;
    }
    syscall::dispatch(frame)
}

#[test_case]
fn test_fork_child_mirrors_parent() {
    reset_scheduler();
    let parent = sched::spawn(spinning_task).expect("spawn should succeed");
    let parent_frame = frame_of(parent);
    let (parent_base, _) = sched::task_stack_bounds(parent).expect("parent stack");

    // Give the parent a recognizable register state with a frame pointer.
    // SAFETY: `parent_frame` is the parent's saved snapshot.
    unsafe {
        (*parent_frame).rbx = 0x1234_5678;
        (*parent_frame).r12 = 0xDEAD_BEEF;
        (*parent_frame).rbp = (*parent_frame).rsp - 16;
        (*parent_frame).rax = 0x77;
    }

    let child = sched::fork_task(parent_frame).expect("fork should succeed");
    assert!(child > parent, "child gets a fresh pid");
    assert_eq!(sched::task_count(), 2, "child is appended");
    assert_eq!(sched::task_state(child), Some(TaskState::Ready));
    assert_eq!(sched::task_state(parent), Some(TaskState::Ready));

    let child_frame = frame_of(child);
    let (child_base, child_top) = sched::task_stack_bounds(child).expect("child stack");
    assert_eq!(
        child_frame as usize - child_base,
        parent_frame as usize - parent_base,
        "child snapshot sits at the parent's offset"
    );

    let p = snapshot(parent_frame);
    let c = snapshot(child_frame);
    let delta = child_base.wrapping_sub(parent_base) as u64;

    assert_eq!(c.rax, 0, "child sees 0 from fork");
    assert_eq!(p.rax, 0x77, "parent rax is left to the syscall layer");
    assert_eq!(c.rsp, p.rsp.wrapping_add(delta), "rsp is relocated");
    assert_eq!(c.rbp, p.rbp.wrapping_add(delta), "rbp is relocated");
    assert!((c.rsp as usize) < child_top && (c.rsp as usize) > child_base);
    assert_eq!(c.rip, p.rip);
    assert_eq!(c.rflags, p.rflags);
    assert_eq!(c.cs, p.cs);
    assert_eq!(c.ss, p.ss);
    assert_eq!(c.rbx, p.rbx);
    assert_eq!(c.r12, p.r12);

    // SAFETY: the return slot at the entry rsp was copied with the stack.
    let child_return_slot = unsafe { *(c.rsp as *const u64) };
    assert_eq!(child_return_slot, task::return_trap_address());
}

#[test_case]
fn test_fork_syscall_sets_parent_result() {
    reset_scheduler();
    let parent = sched::spawn(spinning_task).expect("spawn should succeed");
    let parent_frame = frame_of(parent);

    let resumed = trap(parent_frame, SyscallId::Fork, 0);
    assert!(resumed == parent_frame, "fork resumes the caller");

    let child = snapshot(parent_frame).rax as Pid;
    assert_eq!(sched::task_state(child), Some(TaskState::Ready));
    assert_eq!(snapshot(frame_of(child)).rax, 0);
}

#[test_case]
fn test_fork_on_full_table_fails_without_mutation() {
    reset_scheduler();
    let parent = sched::spawn(spinning_task).expect("spawn should succeed");
    for _ in 1..MAX_TASKS {
        sched::spawn(spinning_task).expect("spawn within capacity should succeed");
    }
    let parent_frame = frame_of(parent);

    assert_eq!(sched::fork_task(parent_frame), Err(SchedulerError::CapacityExceeded));
    assert_eq!(sched::task_count(), MAX_TASKS);

    trap(parent_frame, SyscallId::Fork, 0);
    assert_eq!(snapshot(parent_frame).rax, SYSCALL_FORK_FAILED, "fork reports -1");
    assert_eq!(sched::task_count(), MAX_TASKS);

    reset_scheduler();
}

#[test_case]
fn test_fork_from_non_task_context_fails() {
    reset_scheduler();
    sched::spawn(spinning_task).expect("spawn should succeed");

    let mut bootstrap = RegisterSnapshot::default();
    assert_eq!(
        sched::fork_task(&mut bootstrap as *mut RegisterSnapshot),
        Err(SchedulerError::NotInTask)
    );
    assert_eq!(sched::task_count(), 1);
}

#[test_case]
fn test_wait_unknown_target() {
    reset_scheduler();
    let pid = sched::spawn(spinning_task).expect("spawn should succeed");
    let frame = frame_of(pid);

    assert_eq!(sched::wait_task(frame, 0xFFFF), Err(SchedulerError::UnknownTarget));
    assert_eq!(sched::task_state(pid), Some(TaskState::Ready), "caller must stay ready");

    trap(frame, SyscallId::WaitPid, 0xFFFF);
    assert_eq!(snapshot(frame).rax, 0, "waitpid on unknown pid returns 0");
}

#[test_case]
fn test_wait_on_finished_target_returns_immediately() {
    reset_scheduler();
    let waiter = sched::spawn(spinning_task).expect("spawn should succeed");
    let target = sched::spawn(spinning_task).expect("spawn should succeed");
    let waiter_frame = frame_of(waiter);

    sched::exit_task(frame_of(target));
    assert_eq!(sched::task_state(target), Some(TaskState::Finished));

    let resumed = trap(waiter_frame, SyscallId::WaitPid, target as u64);
    assert!(resumed == waiter_frame, "no switch when the target already finished");
    assert_eq!(snapshot(waiter_frame).rax, SYSCALL_WAIT_OK);
    assert_eq!(sched::task_state(waiter), Some(TaskState::Ready));
}

/// A waiter on a task that never exits is never resumed.
#[test_case]
fn test_waiter_skipped_while_target_runs() {
    reset_scheduler();
    let waiter = sched::spawn(spinning_task).expect("spawn should succeed");
    let target = sched::spawn(spinning_task).expect("spawn should succeed");
    let waiter_frame = frame_of(waiter);
    let target_frame = frame_of(target);

    let mut bootstrap = RegisterSnapshot::default();
    let mut current = sched::on_timer_tick(&mut bootstrap as *mut RegisterSnapshot);
    assert!(current == waiter_frame);

    current = sched::wait_task(current, target).expect("target is known");
    assert!(current == target_frame, "wait switches to the target");
    assert_eq!(sched::task_state(waiter), Some(TaskState::Waiting));

    for _ in 0..32 {
        current = sched::on_timer_tick(current);
        assert!(current == target_frame, "waiter must not be resumed");
    }
    assert_eq!(sched::task_state(waiter), Some(TaskState::Waiting));

    // Exit wakes the waiter right away.
    current = sched::exit_task(current);
    assert_eq!(sched::task_state(waiter), Some(TaskState::Ready));
    assert!(current == waiter_frame);
}

/// Every task waiting: the idle context is resumed.
#[test_case]
fn test_all_waiting_resumes_idle() {
    reset_scheduler();
    let a = sched::spawn(spinning_task).expect("spawn should succeed");
    let b = sched::spawn(spinning_task).expect("spawn should succeed");

    let mut bootstrap = RegisterSnapshot::default();
    let idle = &mut bootstrap as *mut RegisterSnapshot;
    let mut current = sched::on_timer_tick(idle);
    assert_eq!(sched::get_pid(current), Some(a));

    current = sched::wait_task(current, b).expect("b is known");
    assert_eq!(sched::get_pid(current), Some(b));
    current = sched::wait_task(current, a).expect("a is known");

    assert!(current == idle, "no runnable task left");
    assert!(sched::current_index().is_some(), "cursor stays on a valid slot");
    assert_eq!(sched::task_count(), 2);
}

/// T1 spins, T2 forks a child that exits at once, T2 waits for it.
#[test_case]
fn test_fork_wait_exit_scenario() {
    reset_scheduler();
    let t1 = sched::spawn(spinning_task).expect("spawn T1");
    let t2 = sched::spawn(spinning_task).expect("spawn T2");
    let t1_frame = frame_of(t1);
    let t2_frame = frame_of(t2);

    let mut bootstrap = RegisterSnapshot::default();
    let mut current = sched::on_timer_tick(&mut bootstrap as *mut RegisterSnapshot);
    assert!(current == t1_frame);
    current = sched::on_timer_tick(current);
    assert!(current == t2_frame);

    current = trap(current, SyscallId::Fork, 0);
    assert!(current == t2_frame);
    let child = snapshot(t2_frame).rax as Pid;
    let child_frame = frame_of(child);
    assert_eq!(sched::task_count(), 3);

    current = trap(current, SyscallId::WaitPid, child as u64);
    assert!(current == child_frame, "T2 blocks, the child runs next");
    assert_eq!(sched::task_state(t2), Some(TaskState::Waiting));

    for _ in 0..3 {
        current = sched::on_timer_tick(current);
        assert!(current == t1_frame);
        current = sched::on_timer_tick(current);
        assert!(current == child_frame, "T2 is skipped while waiting");
    }

    current = trap(current, SyscallId::Exit, 0);
    assert!(current == t1_frame);
    assert_eq!(sched::task_state(child), Some(TaskState::Finished));
    assert_eq!(sched::task_state(t2), Some(TaskState::Ready));

    current = sched::on_timer_tick(current);
    assert!(current == t2_frame, "T2 resumes after the child finished");
    assert_eq!(snapshot(t2_frame).rax, SYSCALL_WAIT_OK, "waitpid reports success");
    assert_eq!(sched::task_count(), 3, "child not reaped before the cursor reaches it");

    current = sched::on_timer_tick(current);
    assert!(current == t1_frame);
    assert_eq!(sched::task_count(), 2, "child reaped");
    assert_eq!(sched::task_state(child), None);

    current = trap(t2_frame, SyscallId::Exit, 0);
    assert!(current == t1_frame);
}

#[test_case]
fn test_exec_replaces_entry_in_place() {
    reset_scheduler();
    let pid = sched::spawn(spinning_task).expect("spawn should succeed");
    let frame = frame_of(pid);
    let (_, top) = sched::task_stack_bounds(pid).expect("task stack");

    // SAFETY: `frame` is the task's saved snapshot.
    unsafe {
        (*frame).rsp -= 256;
    }

    let resumed = trap(frame, SyscallId::Exec, replacement_entry as usize as u64);
    assert!(resumed == frame);

    let snap = snapshot(frame);
    assert_eq!(snap.rip, replacement_entry as usize as u64);
    assert_eq!(snap.rsp as usize, (top & !0xF) - 8, "stack reset to the entry position");
    assert_eq!(snap.rax, SyscallId::Exec as u64, "exec returns the previous rax");
    assert_eq!(sched::get_pid(frame), Some(pid), "identity is kept");
    assert_eq!(sched::task_count(), 1);
}

#[test_case]
fn test_exec_rejects_null_entry() {
    reset_scheduler();
    let pid = sched::spawn(spinning_task).expect("spawn should succeed");
    let frame = frame_of(pid);
    let rip_before = snapshot(frame).rip;

    trap(frame, SyscallId::Exec, 0);
    assert_eq!(snapshot(frame).rax, syscall::SYSCALL_ERR_INVALID_ARG);
    assert_eq!(snapshot(frame).rip, rip_before);
}

/// A forked child execs a new entry through `int 0x80`; the entry returns
/// into the return trap and the parent's wait completes.
#[test_case]
fn test_exec_through_trap_after_fork() {
    logging::set_capture_enabled(true);
    reset_scheduler();
    sched::spawn(exec_parent).expect("spawn should succeed");
    assert_eq!(sched::task_count(), 1);

    run_until_idle(250 * 10);

    assert_eq!(sched::task_count(), 0, "parent and exec'd child should both exit");
    assert!(logging::captured_contains("console", "exec target ran"));
    assert!(logging::captured_contains("console", "exec child finished"));
    assert!(!logging::captured_contains("console", "exec returned"));
    assert!(!logging::captured_contains("console", "fork failed"));
    logging::set_capture_enabled(false);
}

/// Boot workload on real timer interrupts, until every task has exited.
#[test_case]
fn test_demo_workload_runs_to_completion() {
    logging::set_capture_enabled(true);
    reset_scheduler();
    demotasks::spawn_demo_tasks().expect("boot tasks should spawn");
    assert_eq!(sched::task_count(), 3);

    run_until_idle(250 * 60);

    assert_eq!(sched::task_count(), 0, "all demo tasks should exit");
    assert!(logging::captured_contains("console", "Sum: 249500250000"));
    assert!(logging::captured_contains("console", "Collatz(1): 1"));
    assert!(logging::captured_contains("console", "Collatz(3): 3 10 5 16 8 4 2 1"));
    assert!(logging::captured_contains("console", "Collatz task exiting"));
    assert!(logging::captured_contains("sched", "PID"));
    logging::set_capture_enabled(false);
}
