//! Task objects and the continuation-passing protocol.
//!
//! A task is a boxed [`Task`] body stored in the arena's slab and addressed
//! through a [`TaskRef`]. Bodies receive an [`ExecutionContext`] through which
//! they create children, allocate continuations and recycle themselves. The
//! value returned by [`Task::execute`] is the next task to run on the same
//! thread (bypass).

use std::fmt;

mod cell;
pub(crate) use self::cell::{Allocation, TaskCell};

mod execution;
pub use self::execution::ExecutionContext;

pub(crate) mod harness;

pub mod id;
pub use self::id::{TaskRef, current_task};

mod slab;
pub(crate) use self::slab::TaskSlab;

mod state;
pub use self::state::State;

mod suspend;
pub use self::suspend::SuspendPoint;

/// A unit of work.
///
/// `execute` returns the task that should run next on the current thread, if
/// any. Returning a freshly created child skips the deque entirely. Returning
/// the current task after [`ExecutionContext::recycle_as_child_of`] re-runs it
/// right away.
pub trait Task: Send + 'static {
    fn execute(&mut self, cx: &mut ExecutionContext<'_>) -> Option<TaskRef>;

    /// Invoked instead of `execute` when the task's group was cancelled before
    /// it started. The task is completed afterwards, so counts unwind.
    fn cancel(&mut self, cx: &mut ExecutionContext<'_>) {
        let _ = cx;
    }
}

/// Creates a [`Task`] from a closure.
///
/// The closure runs every time the task is executed, including resumptions
/// after [`ExecutionContext::recycle_as_continuation`].
pub fn from_fn<F>(f: F) -> FnTask<F>
where
    F: FnMut(&mut ExecutionContext<'_>) -> Option<TaskRef> + Send + 'static,
{
    FnTask(f)
}

/// Task returned by [`from_fn`].
pub struct FnTask<F>(F);

impl<F> Task for FnTask<F>
where
    F: FnMut(&mut ExecutionContext<'_>) -> Option<TaskRef> + Send + 'static,
{
    fn execute(&mut self, cx: &mut ExecutionContext<'_>) -> Option<TaskRef> {
        (self.0)(cx)
    }
}

impl<F> fmt::Debug for FnTask<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask").finish_non_exhaustive()
    }
}

/// Runs a closure exactly once. Cancellation drops it unrun.
pub(crate) struct OnceTask<F>(Option<F>);

impl<F> OnceTask<F>
where
    F: FnOnce() + Send + 'static,
{
    pub(crate) fn new(f: F) -> Self {
        Self(Some(f))
    }
}

impl<F> Task for OnceTask<F>
where
    F: FnOnce() + Send + 'static,
{
    fn execute(&mut self, _cx: &mut ExecutionContext<'_>) -> Option<TaskRef> {
        if let Some(f) = self.0.take() {
            f();
        }
        None
    }

    fn cancel(&mut self, _cx: &mut ExecutionContext<'_>) {
        self.0.take();
    }
}
