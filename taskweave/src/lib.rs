//! A work-stealing task scheduler with continuation passing.
//!
//! Tasks live in an arena's slab and are addressed through generational
//! [`TaskRef`] handles. Each participating thread owns a LIFO deque, idle
//! threads steal from the others' FIFO end. A task's [`Task::execute`] may
//! allocate a continuation, recycle itself and return the next task to run
//! inline (bypass). [`TaskGroup`] is the submit-and-wait front door.
//!
//! ```no_run
//! use taskweave::{Arena, TaskGroup};
//!
//! # fn main() -> anyhow::Result<()> {
//! let arena = Arena::builder().max_concurrency(4).try_build()?;
//! let group = TaskGroup::new(&arena)?;
//!
//! for i in 0..8 {
//!     group.run(move || println!("hello from {i}"))?;
//! }
//! group.wait();
//! # Ok(())
//! # }
//! ```

mod context;

pub mod error;
pub use error::{Error, Result, TaskPanic};

pub mod group;
pub use group::{ContextKind, TaskGroup, TaskHandle, WaitStatus};

pub mod runtime;
pub use runtime::{Arena, ArenaStats, Builder, GlobalControl, Priority, this_arena};

pub mod task;
pub use task::{ExecutionContext, State, SuspendPoint, Task, TaskRef, current_task, from_fn};

#[cfg(test)]
mod test_utils;
