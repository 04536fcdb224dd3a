//! Task control block: a private stack with the task's saved
//! [`RegisterSnapshot`] living inside it, plus lifecycle metadata.
//!
//! Tasks are carved out of an explicitly passed [`Heap`] and handed around as
//! [`TaskBox`], which returns the storage to that heap exactly once on drop.

use core::arch::global_asm;
use core::mem::{align_of, size_of};
use core::ptr::{self, addr_of_mut, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::gdt::SegmentSelectors;
use crate::arch::interrupts::{RegisterSnapshot, RFLAGS_IF, RFLAGS_RESERVED};
use crate::config::TASK_STACK_SIZE;
use crate::memory::heap::Heap;
use crate::syscall::SyscallId;

/// Task identity. 0 is reserved for "the kernel" (no task).
pub type Pid = u32;

/// Entry function of a task. Returning from it exits the task.
pub type TaskFn = extern "C" fn();

const STACK_ALIGNMENT: usize = 16;

/// IF=1 so the timer keeps preempting; bit 1 is architecturally reserved.
pub const DEFAULT_RFLAGS: u64 = RFLAGS_IF | RFLAGS_RESERVED;

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

fn allocate_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Eligible for selection.
    Ready,
    /// Skipped until the task it waits on is finished.
    Waiting,
    /// Exited; removed the next time the cursor reaches it.
    Finished,
}

/// Per-task storage.
///
/// The stack comes first so that its top is 16-byte aligned whenever the
/// task itself is. Fork copies live stack bytes between two tasks at the same
/// offset, which keeps every copied frame ABI-aligned.
#[repr(C, align(16))]
pub struct Task {
    stack: [u8; TASK_STACK_SIZE],
    pid: Pid,
    parent_pid: Pid,
    pub(crate) state: TaskState,
    pub(crate) wait_target: Option<Pid>,
    /// Always points inside `stack`.
    pub(crate) snapshot: *mut RegisterSnapshot,
}

extern "C" {
    fn task_return_trap();
}

// Landing pad for a task entry function that returns. Reached via `ret`
// with an unaligned stack, so it must not be Rust code: raise `exit` right
// away and never come back.
global_asm!(
    r#"
    .section .text
    .global task_return_trap
    .type task_return_trap, @function
task_return_trap:
    mov eax, {exit}
    int 0x80
1:
    hlt
    jmp 1b
"#,
    exit = const SyscallId::Exit as u64,
);

/// Address written into the return slot of every fresh task stack.
pub fn return_trap_address() -> u64 {
    task_return_trap as *const () as usize as u64
}

#[inline]
const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

impl Task {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent_pid(&self) -> Pid {
        self.parent_pid
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn wait_target(&self) -> Option<Pid> {
        self.wait_target
    }

    pub fn snapshot_ptr(&self) -> *mut RegisterSnapshot {
        self.snapshot
    }

    /// `(base, top)` of the private stack, top exclusive.
    pub fn stack_bounds(&self) -> (usize, usize) {
        let base = self.stack.as_ptr() as usize;
        (base, base + TASK_STACK_SIZE)
    }

    /// Returns whether a snapshot at `frame` lies completely inside this
    /// task's stack.
    pub fn contains_frame(&self, frame: *const RegisterSnapshot) -> bool {
        if frame.is_null() {
            return false;
        }
        let (base, top) = self.stack_bounds();
        let start = frame as usize;
        start >= base && start + size_of::<RegisterSnapshot>() <= top
    }

    /// `rsp` a task is entered with: 16-byte aligned top minus one return
    /// slot, so the entry function sees a SysV-conforming stack.
    pub fn fresh_entry_rsp(&self) -> usize {
        let (_, top) = self.stack_bounds();
        align_down(top, STACK_ALIGNMENT) - size_of::<u64>()
    }

    /// Writes the return trap into the entry return slot and returns the
    /// entry `rsp`.
    pub(crate) fn prepare_entry_stack(&mut self) -> usize {
        let entry_rsp = self.fresh_entry_rsp();
        // SAFETY:
        // - `entry_rsp` is the highest 8-byte slot of this task's stack.
        unsafe {
            ptr::write(entry_rsp as *mut u64, return_trap_address());
        }
        entry_rsp
    }

    /// Lays out the initial snapshot so the first resume looks like a trap
    /// taken exactly at `entry` on an empty stack.
    fn build_initial_snapshot(&mut self, entry: TaskFn, selectors: SegmentSelectors) {
        let entry_rsp = self.prepare_entry_stack();
        let snapshot = (entry_rsp - size_of::<RegisterSnapshot>()) as *mut RegisterSnapshot;

        // SAFETY:
        // - `snapshot` lies inside this task's stack, right below the return slot.
        // - `entry_rsp` is 8 mod 16, so `snapshot` is 16-byte aligned.
        unsafe {
            ptr::write(
                snapshot,
                RegisterSnapshot {
                    rip: entry as usize as u64,
                    cs: selectors.code as u64,
                    rflags: DEFAULT_RFLAGS,
                    rsp: entry_rsp as u64,
                    ss: selectors.data as u64,
                    ..RegisterSnapshot::default()
                },
            );
        }
        self.snapshot = snapshot;
    }
}

/// Owning handle to a heap-allocated [`Task`].
pub struct TaskBox {
    task: NonNull<Task>,
    /// Pointer returned by `Heap::malloc`; differs from `task` by the
    /// alignment padding.
    raw: NonNull<u8>,
    heap: &'static Heap,
}

// SAFETY:
// - A `TaskBox` is the unique owner of its allocation.
// - It is only moved between contexts under the scheduler lock.
unsafe impl Send for TaskBox {}

impl TaskBox {
    /// Allocates zeroed task storage with a fresh pid and no snapshot.
    fn allocate(heap: &'static Heap, parent_pid: Pid) -> Option<Self> {
        let request = size_of::<Task>() + align_of::<Task>() - 1;
        let raw = NonNull::new(heap.malloc(request))?;
        let aligned = (raw.as_ptr() as usize + align_of::<Task>() - 1) & !(align_of::<Task>() - 1);
        let task = aligned as *mut Task;

        // SAFETY:
        // - `task..task + size_of::<Task>()` lies inside the fresh allocation.
        // - All-zero bytes are a valid `[u8; N]`, `u32` and null pointer; the
        //   enum fields are written explicitly below.
        unsafe {
            ptr::write_bytes(task.cast::<u8>(), 0, size_of::<Task>());
            addr_of_mut!((*task).pid).write(allocate_pid());
            addr_of_mut!((*task).parent_pid).write(parent_pid);
            addr_of_mut!((*task).state).write(TaskState::Ready);
            addr_of_mut!((*task).wait_target).write(None);
            addr_of_mut!((*task).snapshot).write(ptr::null_mut());
        }

        Some(Self {
            // SAFETY: derived from a non-null allocation by rounding up.
            task: unsafe { NonNull::new_unchecked(task) },
            raw,
            heap,
        })
    }

    /// Builds a READY task that starts at `entry` on an empty stack.
    ///
    /// Returns `None` when the heap is exhausted.
    pub fn new(
        heap: &'static Heap,
        entry: TaskFn,
        selectors: SegmentSelectors,
        parent_pid: Pid,
    ) -> Option<Self> {
        let mut task = Self::allocate(heap, parent_pid)?;
        task.build_initial_snapshot(entry, selectors);
        Some(task)
    }

    /// Builds an empty shell that only becomes runnable after
    /// [`TaskBox::fork_from`] filled it in.
    pub fn empty(heap: &'static Heap) -> Option<Self> {
        Self::allocate(heap, 0)
    }

    /// Turns this shell into a copy of `parent` as it was trapped at `frame`.
    ///
    /// Everything from `frame` up to the stack top is copied to the same
    /// offset in this task's stack. The child's snapshot then differs from
    /// the parent's only in `rax` (0) and in `rsp`/`rbp`, which are moved by
    /// the distance between the two stacks when they point into the parent's
    /// stack. Other stack addresses held in registers or in the copied frames
    /// keep pointing at the parent.
    ///
    /// # Safety
    /// - `frame` must be the parent's current trap snapshot, inside
    ///   `parent`'s stack, with the parent not running concurrently.
    pub unsafe fn fork_from(&mut self, parent: &Task, frame: *mut RegisterSnapshot) {
        let (parent_base, parent_top) = parent.stack_bounds();
        let (child_base, _) = self.stack_bounds();
        let offset = frame as usize - parent_base;
        let live_len = parent_top - frame as usize;
        let delta = child_base.wrapping_sub(parent_base);

        // SAFETY:
        // - Source and destination are distinct task stacks of equal size.
        // - `offset + live_len == TASK_STACK_SIZE`.
        unsafe {
            ptr::copy_nonoverlapping(
                frame as *const u8,
                self.stack.as_mut_ptr().add(offset),
                live_len,
            );
        }

        let child_frame = (child_base + offset) as *mut RegisterSnapshot;
        let relocate = |value: u64| -> u64 {
            let addr = value as usize;
            if addr >= parent_base && addr <= parent_top {
                addr.wrapping_add(delta) as u64
            } else {
                value
            }
        };

        // SAFETY:
        // - `child_frame` holds the snapshot copied just above.
        unsafe {
            let snapshot = &mut *child_frame;
            snapshot.rax = 0;
            snapshot.rsp = relocate(snapshot.rsp);
            snapshot.rbp = relocate(snapshot.rbp);
        }

        self.parent_pid = parent.pid;
        self.state = TaskState::Ready;
        self.wait_target = None;
        self.snapshot = child_frame;
    }
}

impl core::ops::Deref for TaskBox {
    type Target = Task;

    fn deref(&self) -> &Task {
        // SAFETY: `task` is valid for the lifetime of the box.
        unsafe { self.task.as_ref() }
    }
}

impl core::ops::DerefMut for TaskBox {
    fn deref_mut(&mut self) -> &mut Task {
        // SAFETY: `task` is valid and uniquely owned.
        unsafe { self.task.as_mut() }
    }
}

impl Drop for TaskBox {
    fn drop(&mut self) {
        self.heap.free(self.raw.as_ptr());
    }
}

const _: () = {
    assert!(TASK_STACK_SIZE % STACK_ALIGNMENT == 0);
    assert!(align_of::<Task>() == STACK_ALIGNMENT);
};
