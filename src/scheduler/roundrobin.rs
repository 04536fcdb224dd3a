//! Round-robin task table with fork/exit/wait semantics.
//!
//! The table is dense: tasks sit in slots `0..num_tasks` in creation order
//! (forked children are appended) and reaping compacts it. All state lives
//! behind one spinlock; every entry point is either a trap handler (where
//! interrupts are already off) or takes the lock, which masks them.

use core::arch::asm;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::vec::Vec;

use crate::arch::gdt::SegmentSelectors;
use crate::arch::interrupts::{self, RegisterSnapshot};
use crate::config::{MAX_TASKS, TRACE_TASK_SWITCHES};
use crate::logging;
use crate::memory::heap::Heap;
use crate::sync::spinlock::SpinLock;
use crate::syscall;

use super::task::{Pid, TaskBox, TaskFn, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    /// [`init`] has not run yet.
    NotInitialized,
    /// The task table already holds `MAX_TASKS` tasks.
    CapacityExceeded,
    /// No task with the requested pid is in the table.
    UnknownTarget,
    /// The heap could not provide storage for a new task.
    OutOfMemory,
    /// The snapshot passed in does not belong to any task.
    NotInTask,
}

/// One row of [`process_table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub index: usize,
    pub pid: Pid,
    pub parent_pid: Pid,
    pub state: TaskState,
    pub wait_target: Option<Pid>,
    pub current: bool,
}

struct Scheduler {
    initialized: bool,
    heap: Option<&'static Heap>,
    selectors: SegmentSelectors,

    /// `tasks[..num_tasks]` are `Some`, the rest `None`.
    tasks: [Option<TaskBox>; MAX_TASKS],
    num_tasks: usize,

    /// Slot of the task selected last. `None` is the empty-table sentinel
    /// (and the state before the first selection).
    current: Option<usize>,

    /// Latest snapshot that did not belong to any task: the boot/idle
    /// context. Resumed when nothing is runnable.
    idle_snapshot: *mut RegisterSnapshot,

    /// A reaped task whose stack still holds the snapshot being processed.
    /// Freed on the next pass, once execution has left that stack.
    retired: Option<TaskBox>,

    tick_count: u64,
}

// SAFETY:
// - `Scheduler` is only reached through `SCHED`.
// - Its raw snapshot pointers point into task stacks or the boot stack and
//   are only dereferenced under the lock.
unsafe impl Send for Scheduler {}

static SCHED: SpinLock<Scheduler> = SpinLock::new(Scheduler::new());

static TRACE_SWITCHES: AtomicBool = AtomicBool::new(TRACE_TASK_SWITCHES);

fn with_sched<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let mut sched = SCHED.lock();
    f(&mut sched)
}

fn trace_enabled() -> bool {
    TRACE_SWITCHES.load(Ordering::Relaxed)
}

impl Scheduler {
    const fn new() -> Self {
        Self {
            initialized: false,
            heap: None,
            selectors: SegmentSelectors::KERNEL,
            tasks: [const { None }; MAX_TASKS],
            num_tasks: 0,
            current: None,
            idle_snapshot: ptr::null_mut(),
            retired: None,
            tick_count: 0,
        }
    }

    fn task(&self, idx: usize) -> &TaskBox {
        match &self.tasks[idx] {
            Some(task) => task,
            None => unreachable!("empty slot {} inside dense table", idx),
        }
    }

    fn task_mut(&mut self, idx: usize) -> &mut TaskBox {
        match &mut self.tasks[idx] {
            Some(task) => task,
            None => unreachable!("empty slot {} inside dense table", idx),
        }
    }

    fn live(&self) -> impl Iterator<Item = &TaskBox> {
        self.tasks[..self.num_tasks].iter().flatten()
    }

    fn index_of(&self, pid: Pid) -> Option<usize> {
        self.live().position(|task| task.pid() == pid)
    }

    /// Slot of the task whose stack contains `frame`.
    fn owner_of(&self, frame: *const RegisterSnapshot) -> Option<usize> {
        self.live().position(|task| task.contains_frame(frame))
    }

    fn ensure_initialized(&self) -> Result<&'static Heap, SchedulerError> {
        match self.heap {
            Some(heap) if self.initialized => Ok(heap),
            _ => Err(SchedulerError::NotInitialized),
        }
    }

    fn push(&mut self, task: TaskBox) -> Result<Pid, SchedulerError> {
        if self.num_tasks >= MAX_TASKS {
            return Err(SchedulerError::CapacityExceeded);
        }
        let pid = task.pid();
        self.tasks[self.num_tasks] = Some(task);
        self.num_tasks += 1;
        Ok(pid)
    }

    fn idle_or(&self, current: *mut RegisterSnapshot) -> *mut RegisterSnapshot {
        if self.idle_snapshot.is_null() {
            current
        } else {
            self.idle_snapshot
        }
    }

    fn release_retired(&mut self, current: *const RegisterSnapshot) {
        let still_in_use = self
            .retired
            .as_ref()
            .is_some_and(|task| task.contains_frame(current));
        if !still_in_use {
            self.retired = None;
        }
    }

    /// Readies every task waiting on `pid`.
    fn wake_waiters(&mut self, pid: Pid) {
        for idx in 0..self.num_tasks {
            let task = self.task_mut(idx);
            if task.state == TaskState::Waiting && task.wait_target == Some(pid) {
                task.state = TaskState::Ready;
                task.wait_target = None;
            }
        }
    }

    /// Removes the task at `idx`, shifting later slots down by one.
    fn reap(&mut self, idx: usize, current: *const RegisterSnapshot) {
        let Some(task) = self.tasks[idx].take() else {
            return;
        };
        self.tasks[idx..self.num_tasks].rotate_left(1);
        self.num_tasks -= 1;

        self.current = match self.current {
            _ if self.num_tasks == 0 => None,
            Some(c) if c > idx => Some(c - 1),
            Some(c) => Some(c.min(self.num_tasks - 1)),
            None => None,
        };

        let pid = task.pid();
        self.wake_waiters(pid);
        if trace_enabled() {
            logging::logln("sched", format_args!("[SCHED] reaped pid {}", pid));
        }

        if task.contains_frame(current) {
            // Still executing on this stack until the trap stub switches away.
            self.retired = Some(task);
        }
    }

    /// Whether a waiter blocked on `target` may run again.
    fn wait_satisfied(&self, target: Option<Pid>) -> bool {
        match target.and_then(|pid| self.index_of(pid)) {
            Some(idx) => self.task(idx).state == TaskState::Finished,
            None => true,
        }
    }

    fn schedule(&mut self, current: *mut RegisterSnapshot) -> *mut RegisterSnapshot {
        self.tick_count = self.tick_count.wrapping_add(1);
        self.release_retired(current);

        if self.num_tasks == 0 {
            self.current = None;
            return current;
        }

        match self.owner_of(current) {
            Some(idx) => {
                self.task_mut(idx).snapshot = current;
                self.current = Some(idx);
            }
            None if !current.is_null() => self.idle_snapshot = current,
            None => {}
        }

        let mut idx = match self.current {
            Some(c) => (c + 1) % self.num_tasks,
            None => 0,
        };

        let mut examined = 0;
        while examined < self.num_tasks {
            match self.task(idx).state {
                TaskState::Finished => {
                    self.reap(idx, current);
                    if self.num_tasks == 0 {
                        return self.idle_or(current);
                    }
                    if idx >= self.num_tasks {
                        idx = 0;
                    }
                }
                TaskState::Waiting => {
                    let target = self.task(idx).wait_target;
                    if self.wait_satisfied(target) {
                        let task = self.task_mut(idx);
                        task.state = TaskState::Ready;
                        task.wait_target = None;
                        return self.select(idx);
                    }
                    idx = (idx + 1) % self.num_tasks;
                    examined += 1;
                }
                TaskState::Ready => return self.select(idx),
            }
        }

        // Everyone is waiting.
        self.current = Some(self.current.map_or(0, |c| c.min(self.num_tasks - 1)));
        self.idle_or(current)
    }

    fn select(&mut self, idx: usize) -> *mut RegisterSnapshot {
        self.current = Some(idx);
        let task = self.task(idx);
        if trace_enabled() {
            logging::logln(
                "sched",
                format_args!("Switching to task {} (pid {})", idx, task.pid()),
            );
        }
        task.snapshot_ptr()
    }
}

/// Resets the scheduler, drops every task and hooks the timer IRQ.
///
/// `heap` provides storage for every task created afterwards; `selectors`
/// go into the snapshot of every new task.
pub fn init(heap: &'static Heap, selectors: SegmentSelectors) {
    // Old tasks are dropped after the lock is released.
    let (old_tasks, old_retired) = with_sched(|s| {
        let old_tasks = core::mem::replace(&mut s.tasks, [const { None }; MAX_TASKS]);
        let old_retired = s.retired.take();
        *s = Scheduler::new();
        s.initialized = true;
        s.heap = Some(heap);
        s.selectors = selectors;
        (old_tasks, old_retired)
    });
    drop(old_tasks);
    drop(old_retired);

    interrupts::register_irq_handler(interrupts::IRQ0_PIT_TIMER_VECTOR, timer_irq_handler);
    logging::logln(
        "sched",
        format_args!("[SCHED] initialized (capacity {})", MAX_TASKS),
    );
}

pub fn is_initialized() -> bool {
    with_sched(|s| s.initialized)
}

/// Appends an already built task in READY state.
pub fn add_task(mut task: TaskBox) -> Result<Pid, SchedulerError> {
    task.state = TaskState::Ready;
    with_sched(|s| {
        s.ensure_initialized()?;
        s.push(task)
    })
}

/// Builds a task entering at `entry` and appends it.
pub fn spawn(entry: TaskFn) -> Result<Pid, SchedulerError> {
    // Allocate outside the scheduler lock.
    let (heap, selectors) = with_sched(|s| {
        let heap = s.ensure_initialized()?;
        if s.num_tasks >= MAX_TASKS {
            return Err(SchedulerError::CapacityExceeded);
        }
        Ok((heap, s.selectors))
    })?;

    let task = TaskBox::new(heap, entry, selectors, 0).ok_or(SchedulerError::OutOfMemory)?;
    let pid = add_task(task)?;
    if trace_enabled() {
        logging::logln("sched", format_args!("[SCHED] spawned pid {}", pid));
    }
    Ok(pid)
}

/// Timer tick: persists `current` and returns the snapshot to resume.
pub fn on_timer_tick(current: *mut RegisterSnapshot) -> *mut RegisterSnapshot {
    with_sched(|s| {
        if !s.initialized {
            return current;
        }
        s.schedule(current)
    })
}

fn timer_irq_handler(_vector: u8, frame: &mut RegisterSnapshot) -> *mut RegisterSnapshot {
    on_timer_tick(frame as *mut RegisterSnapshot)
}

/// Duplicates the task trapped at `current` and returns the child's pid.
///
/// The caller (the syscall layer) stores the pid into the parent's `rax`;
/// the child's `rax` is already 0.
pub fn fork_task(current: *mut RegisterSnapshot) -> Result<Pid, SchedulerError> {
    let heap = with_sched(|s| {
        let heap = s.ensure_initialized()?;
        if s.num_tasks >= MAX_TASKS {
            return Err(SchedulerError::CapacityExceeded);
        }
        s.owner_of(current).ok_or(SchedulerError::NotInTask)?;
        Ok(heap)
    })?;

    let mut child = TaskBox::empty(heap).ok_or(SchedulerError::OutOfMemory)?;

    with_sched(|s| {
        if s.num_tasks >= MAX_TASKS {
            return Err(SchedulerError::CapacityExceeded);
        }
        let parent_idx = s.owner_of(current).ok_or(SchedulerError::NotInTask)?;
        let parent = s.task_mut(parent_idx);
        parent.snapshot = current;

        // SAFETY:
        // - `current` is the parent's trap snapshot (ownership checked above).
        // - The parent is suspended in this trap; interrupts are masked.
        unsafe {
            child.fork_from(parent, current);
        }
        let parent_pid = parent.pid();
        let pid = s.push(child)?;

        if trace_enabled() {
            logging::logln(
                "sched",
                format_args!("[SCHED] pid {} forked child pid {}", parent_pid, pid),
            );
        }
        Ok(pid)
    })
}

/// Points the task trapped at `current` at `entry` with a fresh stack.
///
/// Keeps pid and table slot. Returns the previous `rax`.
pub fn exec_task(current: *mut RegisterSnapshot, entry: u64) -> Result<u64, SchedulerError> {
    with_sched(|s| {
        s.ensure_initialized()?;
        let idx = s.owner_of(current).ok_or(SchedulerError::NotInTask)?;
        let task = s.task_mut(idx);
        let entry_rsp = task.prepare_entry_stack();

        // SAFETY:
        // - `current` lies in this task's stack below the entry slot written
        //   above, and the task is suspended in this trap.
        let snapshot = unsafe { &mut *current };
        let previous_rax = snapshot.rax;
        snapshot.rip = entry;
        snapshot.rsp = entry_rsp as u64;
        task.snapshot = current;
        Ok(previous_rax)
    })
}

/// Blocks the task trapped at `current` until `pid` has finished.
///
/// Returns the snapshot to resume: `current` itself when `pid` is already
/// finished, otherwise whatever the scheduler picks next.
pub fn wait_task(
    current: *mut RegisterSnapshot,
    pid: Pid,
) -> Result<*mut RegisterSnapshot, SchedulerError> {
    with_sched(|s| {
        s.ensure_initialized()?;
        let caller = s.owner_of(current).ok_or(SchedulerError::NotInTask)?;
        let target = s.index_of(pid).ok_or(SchedulerError::UnknownTarget)?;
        if s.task(target).state == TaskState::Finished {
            return Ok(current);
        }

        let task = s.task_mut(caller);
        task.snapshot = current;
        task.state = TaskState::Waiting;
        task.wait_target = Some(pid);
        let caller_pid = task.pid();
        if trace_enabled() {
            logging::logln(
                "sched",
                format_args!("[SCHED] pid {} waits for pid {}", caller_pid, pid),
            );
        }
        Ok(s.schedule(current))
    })
}

/// Finishes the task trapped at `current` and returns the next snapshot.
///
/// Waiters are readied immediately; the task itself is reaped once the
/// cursor reaches it.
pub fn exit_task(current: *mut RegisterSnapshot) -> *mut RegisterSnapshot {
    with_sched(|s| {
        if !s.initialized {
            return current;
        }
        let Some(idx) = s.owner_of(current) else {
            logging::logln(
                "sched",
                format_args!("[SCHED] exit from non-task context ignored"),
            );
            return current;
        };

        let task = s.task_mut(idx);
        task.state = TaskState::Finished;
        task.wait_target = None;
        let pid = task.pid();
        s.wake_waiters(pid);
        if trace_enabled() {
            logging::logln("sched", format_args!("[SCHED] pid {} exited", pid));
        }
        s.schedule(current)
    })
}

/// Finishes the calling task. Never returns.
pub fn exit_current_task() -> ! {
    syscall::user::sys_exit()
}

/// Gives up the CPU by raising the timer vector.
pub fn yield_now() {
    // SAFETY:
    // - Software interrupt to the IRQ0 vector takes the timer path.
    // - Valid in ring 0, which holds for all kernel tasks.
    unsafe {
        asm!(
            "int {vector}",
            vector = const interrupts::IRQ0_PIT_TIMER_VECTOR,
            options(nomem)
        );
    }
}

/// Pid of the task trapped at `frame`. `None` for the idle context.
pub fn get_pid(frame: *const RegisterSnapshot) -> Option<Pid> {
    with_sched(|s| s.owner_of(frame).map(|idx| s.task(idx).pid()))
}

pub fn task_count() -> usize {
    with_sched(|s| s.num_tasks)
}

/// Cursor position; `None` when the table is empty.
pub fn current_index() -> Option<usize> {
    with_sched(|s| s.current)
}

pub fn tick_count() -> u64 {
    with_sched(|s| s.tick_count)
}

pub fn task_state(pid: Pid) -> Option<TaskState> {
    with_sched(|s| s.index_of(pid).map(|idx| s.task(idx).state))
}

/// Saved snapshot of `pid`. Valid only while the task is not running.
pub fn task_snapshot_ptr(pid: Pid) -> Option<*mut RegisterSnapshot> {
    with_sched(|s| s.index_of(pid).map(|idx| s.task(idx).snapshot_ptr()))
}

/// `(base, top)` of the stack of `pid`.
pub fn task_stack_bounds(pid: Pid) -> Option<(usize, usize)> {
    with_sched(|s| s.index_of(pid).map(|idx| s.task(idx).stack_bounds()))
}

/// One row per task in table order.
pub fn process_table() -> Vec<TaskInfo> {
    // Reserve before locking: the heap must not be entered for growth while
    // the scheduler lock is held by this path.
    let mut rows = Vec::with_capacity(MAX_TASKS);
    with_sched(|s| {
        for (index, task) in s.live().enumerate() {
            rows.push(TaskInfo {
                index,
                pid: task.pid(),
                parent_pid: task.parent_pid(),
                state: task.state(),
                wait_target: task.wait_target(),
                current: s.current == Some(index),
            });
        }
    });
    rows
}

/// Logs the task table on the `sched` target.
pub fn print_process_table() {
    let rows = process_table();
    logging::logln(
        "sched",
        format_args!("IDX  PID  PPID  STATE     WAIT  ({} tasks)", rows.len()),
    );
    for row in &rows {
        let wait = row.wait_target.unwrap_or(0);
        logging::logln(
            "sched",
            format_args!(
                "{}{:<4}{:<5}{:<6}{:<10}{}",
                if row.current { '*' } else { ' ' },
                row.index,
                row.pid,
                row.parent_pid,
                state_name(row.state),
                wait
            ),
        );
    }
}

pub fn state_name(state: TaskState) -> &'static str {
    match state {
        TaskState::Ready => "READY",
        TaskState::Waiting => "WAITING",
        TaskState::Finished => "FINISHED",
    }
}

/// Turns switch/lifecycle tracing on or off; returns the previous setting.
pub fn set_trace_switches(enabled: bool) -> bool {
    TRACE_SWITCHES.swap(enabled, Ordering::Relaxed)
}
