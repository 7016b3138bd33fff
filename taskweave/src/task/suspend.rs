use crate::context;
use crate::runtime::stealing::Shared;
use crate::task::TaskRef;
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

/// A task suspended through [`ExecutionContext::suspend`].
///
/// The suspended task keeps its slot and its parent's count. Resuming it,
/// from any thread, schedules it again on its arena. It is then executed with
/// [`ExecutionContext::is_resumed`] set, once its own children (if any) have
/// finished as well.
///
/// Dropping an unresumed point resumes the task, so that waiters on its
/// group are not stuck forever.
///
/// [`ExecutionContext::suspend`]: crate::ExecutionContext::suspend
/// [`ExecutionContext::is_resumed`]: crate::ExecutionContext::is_resumed
pub struct SuspendPoint {
    shared: Arc<Shared>,
    task: Option<TaskRef>,
}

impl SuspendPoint {
    pub(crate) fn new(shared: Arc<Shared>, task: TaskRef) -> Self {
        Self {
            shared,
            task: Some(task),
        }
    }

    /// Handle of the suspended task.
    pub fn task(&self) -> Option<TaskRef> {
        self.task
    }

    pub fn resume(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        let Some(cell) = self.shared.slab.get(task) else {
            warn!(%task, "suspended task vanished before resume");
            return;
        };

        // The execution reference may still be held if `execute` did not
        // return yet, the harness schedules the task in that case.
        if cell.refs.release_self_ref() {
            trace!(%task, "resuming suspended task");
            context::push(&self.shared, task);
        }
    }
}

impl Drop for SuspendPoint {
    fn drop(&mut self) {
        if let Some(task) = self.task {
            warn!(%task, "suspend point dropped without resume, resuming");
            self.release();
        }
    }
}

impl fmt::Debug for SuspendPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendPoint")
            .field("task", &self.task)
            .finish()
    }
}
