use crate::context;
use crate::error::{Error, Result};
use crate::runtime::stealing::Shared;
use crate::task::{Allocation, State, SuspendPoint, Task, TaskCell, TaskRef};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Handle passed to [`Task::execute`] and [`Task::cancel`].
///
/// All task-graph wiring goes through it: creating children, allocating a
/// continuation, recycling the running task and spawning.
pub struct ExecutionContext<'a> {
    shared: &'a Arc<Shared>,
    task: TaskRef,
    cell: &'a TaskCell,
    resumed: bool,

    /// Self-reference holds taken during this execution, released by the
    /// harness once `execute` returns.
    armed: SmallVec<[TaskRef; 2]>,

    /// Continuations allocated here, with the number of children they were
    /// promised that were not created yet.
    promised: SmallVec<[(TaskRef, u64); 2]>,

    /// Children created here that were neither spawned nor returned yet.
    unscheduled: SmallVec<[TaskRef; 4]>,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(
        shared: &'a Arc<Shared>,
        task: TaskRef,
        cell: &'a TaskCell,
        resumed: bool,
    ) -> Self {
        Self {
            shared,
            task,
            cell,
            resumed,
            armed: SmallVec::new(),
            promised: SmallVec::new(),
            unscheduled: SmallVec::new(),
        }
    }

    pub(crate) fn take_armed(&mut self) -> SmallVec<[TaskRef; 2]> {
        std::mem::take(&mut self.armed)
    }

    /// Settles the wiring a panicking body left half done: children that
    /// were never scheduled are pushed so they go through `cancel()`, and
    /// continuations stop waiting for children that were never created.
    ///
    /// The armed holds are still in place, so no continuation can become
    /// ready here.
    pub(crate) fn unwind(&mut self) {
        for task in std::mem::take(&mut self.unscheduled) {
            trace!(%task, "scheduling orphaned child for cancellation");
            context::push(self.shared, task);
        }

        for (continuation, missing) in std::mem::take(&mut self.promised) {
            let Some(cell) = self.shared.slab.get(continuation) else {
                continue;
            };

            trace!(%continuation, missing, "releasing children never created");
            for _ in 0..missing {
                let zero = cell.refs.release_child();
                debug_assert!(!zero, "continuation released before its hold");
            }
        }
    }

    /// Handle of the running task.
    pub fn current(&self) -> TaskRef {
        self.task
    }

    /// True when this execution is the resumption of a task recycled as a
    /// continuation, i.e. all of its children finished.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// True when the task's group (or an ancestor group it is bound to) was
    /// cancelled. Long running bodies may poll this to stop early.
    pub fn is_cancelled(&self) -> bool {
        self.cell.group.is_cancelled()
    }

    /// Creates a task whose parent is `parent`. The parent's child count is
    /// left untouched, the caller accounts for it (usually through the
    /// `refcount` given to [`allocate_continuation`]).
    ///
    /// The child is not scheduled: [`spawn`] it or return it from `execute`.
    ///
    /// [`allocate_continuation`]: ExecutionContext::allocate_continuation
    /// [`spawn`]: ExecutionContext::spawn
    pub fn create_child<T: Task>(&mut self, parent: TaskRef, body: T) -> Result<TaskRef> {
        self.resolve(parent)?;

        let child = self.shared.slab.insert(TaskCell::new_heap(
            Box::new(body),
            Some(parent),
            Arc::clone(&self.cell.group),
        ))?;

        if let Some((_, missing)) = self.promised.iter_mut().find(|(c, _)| *c == parent) {
            *missing = missing.saturating_sub(1);
        }
        self.unscheduled.push(child);
        Ok(child)
    }

    /// Same as [`create_child`](ExecutionContext::create_child), but the
    /// parent's child count is incremented once the child is allocated.
    pub fn create_child_and_increment<T: Task>(
        &mut self,
        parent: TaskRef,
        body: T,
    ) -> Result<TaskRef> {
        let parent_cell = self.resolve(parent)?;

        let child = self.shared.slab.insert(TaskCell::new_heap(
            Box::new(body),
            Some(parent),
            Arc::clone(&self.cell.group),
        ))?;

        parent_cell.refs.add_child();
        self.unscheduled.push(child);
        Ok(child)
    }

    /// Adds one to a task's outstanding children.
    pub fn add_child_reference(&mut self, parent: TaskRef) -> Result<()> {
        self.resolve(parent)?.refs.add_child();
        Ok(())
    }

    /// Allocates a continuation that takes over the running task's parent and
    /// waits for `refcount` children. The running task is left without a
    /// parent, so completing it does not signal anyone.
    ///
    /// The continuation cannot fire before the current `execute` returns.
    pub fn allocate_continuation<T: Task>(&mut self, refcount: u64, body: T) -> Result<TaskRef> {
        let continuation = self.shared.slab.insert(TaskCell::new_continuation(
            Box::new(body),
            self.cell.parent(),
            refcount,
            Arc::clone(&self.cell.group),
        ))?;

        self.cell.set_parent(None);
        self.armed.push(continuation);
        self.promised.push((continuation, refcount));
        Ok(continuation)
    }

    /// Turns the running task into a continuation of its own children. It is
    /// executed again (with [`is_resumed`](ExecutionContext::is_resumed) set)
    /// once every child has finished.
    pub fn recycle_as_continuation(&mut self) -> Result<()> {
        self.check_recyclable(State::Continuation)?;
        self.cell
            .state
            .transition(State::Executing, State::Continuation)?;

        self.cell.refs.add_self_ref();
        self.armed.push(self.task);
        Ok(())
    }

    /// Suspends the running task until the returned point is resumed.
    ///
    /// The body should return right away. The task is not completed: its
    /// slot and its parent's count stay held, and resuming it executes it
    /// again with [`is_resumed`](ExecutionContext::is_resumed) set. Children
    /// created after suspending also have to finish before it runs again.
    /// Cancelling the group does not resume suspended tasks.
    pub fn suspend(&mut self) -> Result<SuspendPoint> {
        self.check_recyclable(State::Continuation)?;
        self.cell
            .state
            .transition(State::Executing, State::Continuation)?;

        // Released by the suspend point instead of the harness.
        self.cell.refs.add_self_ref();
        Ok(SuspendPoint::new(Arc::clone(self.shared), self.task))
    }

    /// Reassigns the running task's parent to `new_parent`, without touching
    /// any count. Once `execute` returns the task runs again as a new logical
    /// task, inline if it returned itself.
    pub fn recycle_as_child_of(&mut self, new_parent: TaskRef) -> Result<()> {
        self.check_recyclable(State::RecycledAsChild)?;

        if cfg!(debug_assertions) {
            let children = self.cell.refs.children();
            if children > 0 {
                return Err(Error::LiveChildren {
                    task: self.task,
                    children,
                });
            }
        }

        self.resolve(new_parent)?;
        self.cell
            .state
            .transition(State::Executing, State::RecycledAsChild)?;

        self.cell.set_parent(Some(new_parent));
        Ok(())
    }

    /// Schedules a task created by this context.
    pub fn spawn(&mut self, task: TaskRef) -> Result<()> {
        let cell = self.resolve(task)?;
        let state = cell.state.load();
        if !state.is_runnable() {
            return Err(Error::InvalidTransition {
                from: state,
                to: State::Executing,
            });
        }

        self.unscheduled.retain(|t| *t != task);
        context::push(self.shared, task);
        Ok(())
    }

    fn check_recyclable(&self, to: State) -> Result<()> {
        if self.cell.allocation == Allocation::Stack {
            return Err(Error::InvalidTransition {
                from: self.cell.state.load(),
                to,
            });
        }

        Ok(())
    }

    fn resolve(&self, task: TaskRef) -> Result<Arc<TaskCell>> {
        self.shared.slab.get(task).ok_or(Error::StaleTask(task))
    }
}

impl fmt::Debug for ExecutionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("task", &self.task)
            .field("resumed", &self.resumed)
            .field("armed", &self.armed)
            .field("unscheduled", &self.unscheduled)
            .finish()
    }
}
