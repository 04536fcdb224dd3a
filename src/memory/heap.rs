//! First-fit kernel heap over one fixed arena.
//!
//! Every block starts with a one-word header holding the block size (header
//! included) with the allocation flag folded into bit 0. Allocation splits a
//! free block when the tail can still hold a header plus one byte. Freeing
//! coalesces runs of neighbouring free blocks.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::KERNEL_HEAP_SIZE;
use crate::logging;
use crate::sync::spinlock::SpinLock;

/// Payload alignment of every block.
pub const HEAP_ALIGNMENT: usize = align_of::<usize>();

const HEADER: usize = size_of::<BlockHeader>();
const USED: usize = 1;

#[repr(transparent)]
struct BlockHeader(usize);

impl BlockHeader {
    fn size(&self) -> usize {
        self.0 & !USED
    }

    fn used(&self) -> bool {
        self.0 & USED != 0
    }
}

/// Raw view of one block inside the arena.
#[derive(Clone, Copy)]
struct Block {
    addr: usize,
    size: usize,
    used: bool,
}

impl Block {
    fn payload(self) -> *mut u8 {
        (self.addr + HEADER) as *mut u8
    }

    /// # Safety
    /// - `addr` must be an aligned address inside an arena owned by the
    ///   caller's locked heap.
    unsafe fn write_header(addr: usize, size: usize, used: bool) {
        let word = size | if used { USED } else { 0 };
        // SAFETY: guaranteed by the caller.
        unsafe { (addr as *mut BlockHeader).write(BlockHeader(word)) };
    }
}

/// Arena bounds, `end` exclusive.
#[derive(Clone, Copy, Default)]
struct Arena {
    start: usize,
    end: usize,
}

impl Arena {
    /// Walks headers from the arena start. Stops at the end or at the first
    /// header that cannot describe a block.
    fn blocks(self) -> impl Iterator<Item = Block> {
        let mut next = self.start;
        core::iter::from_fn(move || {
            if next >= self.end {
                return None;
            }
            // SAFETY:
            // - `next` is a block boundary inside the arena; the heap lock is
            //   held by whoever produced `self`.
            let header = unsafe { &*(next as *const BlockHeader) };
            let size = header.size();
            if size < HEADER || size > self.end - next {
                return None;
            }
            let block = Block {
                addr: next,
                size,
                used: header.used(),
            };
            next += size;
            Some(block)
        })
    }

    fn first_fit(self, size: usize) -> Option<Block> {
        self.blocks().find(|b| !b.used && b.size >= size)
    }

    fn block_of(self, payload: *mut u8) -> Option<Block> {
        self.blocks().find(|b| b.payload() == payload)
    }

    fn take(self, block: Block, size: usize) {
        // SAFETY: `block` came from `blocks()` on this arena and is free.
        unsafe {
            if block.size - size > HEADER {
                Block::write_header(block.addr, size, true);
                Block::write_header(block.addr + size, block.size - size, false);
            } else {
                Block::write_header(block.addr, block.size, true);
            }
        }
    }

    fn coalesce(self) {
        let mut run: Option<Block> = None;
        for block in self.blocks() {
            if block.used {
                run = None;
                continue;
            }
            if let Some(head) = run.as_mut() {
                head.size += block.size;
                // SAFETY: `head` is a free block header in this arena.
                unsafe { Block::write_header(head.addr, head.size, false) };
            } else {
                run = Some(block);
            }
        }
    }
}

/// Usage counters produced by a full block walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// Largest single free block, header included.
    pub largest_free_block: usize,
}

pub struct Heap {
    arena: SpinLock<Arena>,
    initialized: AtomicBool,
    debug_output: AtomicBool,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub const fn new() -> Self {
        Self {
            arena: SpinLock::new(Arena { start: 0, end: 0 }),
            initialized: AtomicBool::new(false),
            debug_output: AtomicBool::new(false),
        }
    }

    /// Formats `start..start + size` as a single free block and returns the
    /// number of bytes managed, or 0 if the region is too small.
    ///
    /// Re-initializing forgets every live allocation.
    ///
    /// # Safety
    /// - The region must be writable and owned by this heap for as long as
    ///   the heap is used.
    /// - Pointers from an earlier `init` must not be used afterwards.
    pub unsafe fn init(&self, start: usize, size: usize) -> usize {
        let Some(first) = start.checked_next_multiple_of(HEAP_ALIGNMENT) else {
            return 0;
        };
        let managed = size.saturating_sub(first - start) & !(HEAP_ALIGNMENT - 1);
        if managed < HEADER + HEAP_ALIGNMENT {
            return 0;
        }

        {
            let mut arena = self.arena.lock();
            // SAFETY: the caller hands the region over to this heap.
            unsafe { Block::write_header(first, managed, false) };
            *arena = Arena {
                start: first,
                end: first + managed,
            };
        }
        self.initialized.store(true, Ordering::Release);
        self.log(format_args!("[HEAP] init start={:#x} size={}", first, managed));
        managed
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn debug_output_enabled(&self) -> bool {
        self.debug_output.load(Ordering::Acquire)
    }

    /// Returns the previous setting.
    pub fn set_debug_output(&self, enabled: bool) -> bool {
        self.debug_output.swap(enabled, Ordering::AcqRel)
    }

    /// Called with the arena unlocked so the logger may allocate.
    fn log(&self, args: fmt::Arguments<'_>) {
        if self.debug_output_enabled() {
            logging::logln_with_options("heap", args, true, true);
        }
    }

    fn arena(&self) -> Arena {
        *self.arena.lock()
    }

    /// Returns a payload of at least `size` bytes, or null.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        if !self.is_initialized() {
            return ptr::null_mut();
        }
        let Some(block_size) = size
            .checked_add(HEADER)
            .and_then(|n| n.checked_next_multiple_of(HEAP_ALIGNMENT))
        else {
            self.log(format_args!("[HEAP] alloc failed (overflow) requested={}", size));
            return ptr::null_mut();
        };

        let found = {
            let arena = self.arena.lock();
            arena.first_fit(block_size).map(|block| {
                arena.take(block, block_size);
                block.payload()
            })
        };

        match found {
            Some(payload) => {
                self.log(format_args!(
                    "[HEAP] alloc ptr={:#x} requested={} block={}",
                    payload as usize, size, block_size
                ));
                payload
            }
            None => {
                self.log(format_args!(
                    "[HEAP] alloc failed (exhausted) requested={} block={}",
                    size, block_size
                ));
                ptr::null_mut()
            }
        }
    }

    /// Releases a payload from [`Heap::malloc`]. Foreign pointers and double
    /// frees are ignored and logged.
    pub fn free(&self, payload: *mut u8) {
        if payload.is_null() {
            return;
        }

        let outcome = {
            let arena = self.arena.lock();
            match arena.block_of(payload) {
                None => Err("invalid pointer"),
                Some(block) if !block.used => Err("double free"),
                Some(block) => {
                    // SAFETY: `block` is an allocated block of this arena.
                    unsafe { Block::write_header(block.addr, block.size, false) };
                    arena.coalesce();
                    Ok(block.size)
                }
            }
        };

        match outcome {
            Ok(size) => self.log(format_args!(
                "[HEAP] free ptr={:#x} block={}",
                payload as usize, size
            )),
            Err(reason) => self.log(format_args!(
                "[HEAP] free rejected ptr={:#x} reason={}",
                payload as usize, reason
            )),
        }
    }

    /// Whether `ptr` lies inside the managed arena.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let arena = self.arena();
        (arena.start..arena.end).contains(&(ptr as usize))
    }

    pub fn stats(&self) -> HeapStats {
        let arena = self.arena.lock();
        arena.blocks().fold(
            HeapStats {
                total_bytes: arena.end - arena.start,
                ..HeapStats::default()
            },
            |mut stats, block| {
                if block.used {
                    stats.used_bytes += block.size;
                    stats.used_blocks += 1;
                } else {
                    stats.free_bytes += block.size;
                    stats.free_blocks += 1;
                    stats.largest_free_block = stats.largest_free_block.max(block.size);
                }
                stats
            },
        )
    }

    /// `(block_size, in_use)` of the block whose header sits `offset` bytes
    /// into the arena.
    pub fn block_at(&self, offset: usize) -> Option<(usize, bool)> {
        let arena = self.arena.lock();
        let addr = arena.start.checked_add(offset)?;
        arena
            .blocks()
            .find(|b| b.addr == addr)
            .map(|b| (b.size, b.used))
    }
}

#[repr(C, align(16))]
struct ArenaStorage(UnsafeCell<[u8; KERNEL_HEAP_SIZE]>);

// SAFETY: only `KERNEL_HEAP` touches the storage, under its lock.
unsafe impl Sync for ArenaStorage {}

static ARENA: ArenaStorage = ArenaStorage(UnsafeCell::new([0; KERNEL_HEAP_SIZE]));

/// Serves the global allocator and task storage.
static KERNEL_HEAP: Heap = Heap::new();

/// Hands the static arena to the kernel heap. Later calls only update the
/// debug flag and return the same heap.
pub fn init(debug_output: bool) -> &'static Heap {
    KERNEL_HEAP.set_debug_output(debug_output);
    if !KERNEL_HEAP.is_initialized() {
        // SAFETY:
        // - `ARENA` belongs to `KERNEL_HEAP` alone.
        // - Formatting happens once, guarded by `is_initialized`.
        unsafe {
            KERNEL_HEAP.init(ARENA.0.get() as usize, KERNEL_HEAP_SIZE);
        }
    }
    &KERNEL_HEAP
}

/// The kernel heap, initialized or not.
pub fn kernel_heap() -> &'static Heap {
    &KERNEL_HEAP
}
