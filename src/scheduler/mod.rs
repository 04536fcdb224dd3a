//! Scheduler module facade.
//!
//! The task table and its operations live in `roundrobin.rs` and are
//! re-exported here so `crate::scheduler::*` call sites stay clean.

pub mod demotasks;
mod roundrobin;
pub mod task;

pub use roundrobin::*;
pub use task::{Pid, Task, TaskBox, TaskFn, TaskState};
