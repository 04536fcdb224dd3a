//! `#[global_allocator]` backed by the kernel heap.
//!
//! The heap hands out 8-byte aligned payloads. Stricter layouts are served by
//! over-allocating and stashing the heap's own pointer in the word just below
//! the aligned payload.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr;

use crate::memory::heap::{self, HEAP_ALIGNMENT};

const STASH: usize = size_of::<*mut u8>();

pub struct KernelAllocator;

impl KernelAllocator {
    fn alloc_over_aligned(size: usize, align: usize) -> *mut u8 {
        let Some(padded) = size.checked_add(align - 1 + STASH) else {
            return ptr::null_mut();
        };

        let heap = heap::kernel_heap();
        let block = heap.malloc(padded);
        if block.is_null() {
            return block;
        }

        let offset = (block as usize + STASH).next_multiple_of(align) - block as usize;
        // SAFETY:
        // - `offset <= align - 1 + STASH`, so the payload fits inside `padded`.
        // - The stash word sits between `block` and the payload.
        unsafe {
            let payload = block.add(offset);
            payload.sub(STASH).cast::<*mut u8>().write_unaligned(block);
            payload
        }
    }
}

// SAFETY:
// - The heap locks its own state on every call.
// - Returned pointers satisfy `layout.align()` and cover `layout.size()`.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(1);
        match layout.align() {
            align if align <= HEAP_ALIGNMENT => heap::kernel_heap().malloc(size),
            align => Self::alloc_over_aligned(size, align),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }

        let block = if layout.align() <= HEAP_ALIGNMENT {
            ptr
        } else {
            // SAFETY: written by `alloc_over_aligned` for this payload.
            unsafe { ptr.sub(STASH).cast::<*mut u8>().read_unaligned() }
        };
        heap::kernel_heap().free(block);
    }
}

#[global_allocator]
pub static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;
