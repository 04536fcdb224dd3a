//! Memory management. All tasks share one address space, so this is only the
//! kernel heap.

pub mod heap;
