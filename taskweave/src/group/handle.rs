use crate::runtime::stealing::Shared;
use crate::task::{TaskRef, harness};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// A task allocated by [`TaskGroup::defer`](crate::TaskGroup::defer) that was
/// not scheduled yet.
///
/// The owning group waits for it. Dropping the handle releases the task
/// without running it.
pub struct TaskHandle {
    shared: Arc<Shared>,
    task: Option<TaskRef>,
    root: TaskRef,
}

impl TaskHandle {
    pub(crate) fn new(shared: Arc<Shared>, task: TaskRef, root: TaskRef) -> Self {
        Self {
            shared,
            task: Some(task),
            root,
        }
    }

    pub(crate) fn root(&self) -> TaskRef {
        self.root
    }

    pub(crate) fn take(&mut self) -> Option<TaskRef> {
        self.task.take()
    }

    pub fn task(&self) -> Option<TaskRef> {
        self.task
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        trace!(%task, "releasing unrun deferred task");

        if let Some(cell) = self.shared.slab.remove(task)
            && let Some(parent) = cell.parent()
        {
            drop(cell);

            // The parent is the group's root, it never becomes runnable.
            let ready = harness::release_parent(&self.shared, parent);
            debug_assert!(ready.is_none());
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task", &self.task)
            .field("root", &self.root)
            .finish()
    }
}
