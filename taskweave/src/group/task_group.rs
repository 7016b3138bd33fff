use crate::context;
use crate::error::{Error, Result};
use crate::group::{ContextKind, GroupContext, TaskHandle, WaitStatus};
use crate::runtime::Arena;
use crate::runtime::stealing::Seat;
use crate::task::{OnceTask, Task, TaskCell, TaskRef, harness};
use anyhow::anyhow;
use std::fmt;
use std::hint;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// How long a waiting thread sleeps on the root before looking for work again.
/// Producers only unpark pool workers, so this bounds how long new work can
/// sit next to an idle waiter.
const WAIT_PARK_TIMEOUT: Duration = Duration::from_millis(1);

/// Submit work and wait for all of it to finish.
///
/// Every submission becomes a child of the group's root sentinel. Waiting
/// threads execute and steal work until the root's count drops to zero.
pub struct TaskGroup {
    arena: Arena,
    context: Arc<GroupContext>,
    root: TaskRef,
    root_cell: Arc<TaskCell>,
}

impl TaskGroup {
    /// Creates a group whose context is bound to the task currently running
    /// on this thread, if any.
    pub fn new(arena: &Arena) -> Result<Self> {
        Self::with_kind(arena, ContextKind::Bound)
    }

    pub fn with_kind(arena: &Arena, kind: ContextKind) -> Result<Self> {
        let context = match (kind, context::current_group()) {
            (ContextKind::Bound, Some(parent)) => GroupContext::new_bound(&parent),
            _ => GroupContext::new(kind),
        };

        let shared = arena.shared();
        let root = shared
            .slab
            .insert(TaskCell::new_root(Arc::clone(&context)))?;
        let root_cell = shared.slab.get(root).ok_or(Error::StaleTask(root))?;
        debug!(%root, kind = ?context.kind(), "task group created");

        Ok(Self {
            arena: arena.clone(),
            context,
            root,
            root_cell,
        })
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Runs `f` asynchronously as part of the group.
    pub fn run<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(OnceTask::new(f)).map(|_| ())
    }

    /// Schedules a task as a child of the group's root.
    pub fn spawn<T: Task>(&self, task: T) -> Result<TaskRef> {
        let task = self.allocate(task)?;
        context::push(self.arena.shared(), task);
        Ok(task)
    }

    /// Allocates `f` without scheduling it. The group keeps waiting for it
    /// until the handle is passed to [`run_handle`](TaskGroup::run_handle) or
    /// dropped.
    pub fn defer<F>(&self, f: F) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let task = self.allocate(OnceTask::new(f))?;
        Ok(TaskHandle::new(Arc::clone(self.arena.shared()), task, self.root))
    }

    /// Schedules a task obtained from [`defer`](TaskGroup::defer).
    pub fn run_handle(&self, mut handle: TaskHandle) -> Result<()> {
        if handle.root() != self.root {
            return Err(Error::Other(anyhow!(
                "task handle belongs to another task group"
            )));
        }

        match handle.take() {
            Some(task) => {
                context::push(self.arena.shared(), task);
                Ok(())
            }
            None => Err(Error::Other(anyhow!("task handle was already consumed"))),
        }
    }

    fn allocate<T: Task>(&self, task: T) -> Result<TaskRef> {
        let shared = self.arena.shared();
        self.arena.ensure_started()?;

        let task = shared.slab.insert(TaskCell::new_heap(
            Box::new(task),
            Some(self.root),
            Arc::clone(&self.context),
        ))?;

        self.root_cell.refs.add_child();
        Ok(task)
    }

    /// Runs `f` on the calling thread as part of the group, then waits.
    pub fn run_and_wait<F>(&self, f: F) -> Result<WaitStatus>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = self.arena.shared();
        self.arena.ensure_started()?;

        let task = shared.slab.insert(TaskCell::new_stack(
            Box::new(OnceTask::new(f)),
            Some(self.root),
            Arc::clone(&self.context),
        ))?;
        self.root_cell.refs.add_child();

        {
            let _enter = context::enter(shared, Seat::External);
            harness::run(shared, task);
        }
        shared.slab.remove(task);

        Ok(self.wait())
    }

    /// Waits for every task of the group, contributing to the work meanwhile.
    ///
    /// If a task panicked, the first panic is resumed on this thread once all
    /// tasks have finished or were cancelled.
    pub fn wait(&self) -> WaitStatus {
        match self.try_wait() {
            Ok(status) => status,
            Err(Error::Panicked(panic)) => panic.resume(),
            Err(e) => {
                error!(error = %e, "unexpected error while waiting");
                WaitStatus::Cancelled
            }
        }
    }

    /// Like [`wait`](TaskGroup::wait), but a panic is returned as
    /// [`Error::Panicked`] instead of being resumed.
    pub fn try_wait(&self) -> Result<WaitStatus> {
        self.wait_for_root();

        let status = if self.context.is_cancelled() {
            WaitStatus::Cancelled
        } else {
            WaitStatus::Complete
        };

        let panic = self.context.take_panic();
        self.context.reset();

        match panic {
            Some(panic) => Err(Error::Panicked(panic)),
            None => Ok(status),
        }
    }

    fn wait_for_root(&self) {
        let refs = &self.root_cell.refs;
        if refs.is_zero() {
            return;
        }

        let shared = self.arena.shared();
        let _enter = context::enter(shared, Seat::External);
        let Some(worker) = context::current_worker() else {
            return;
        };

        let idle_spins = shared.cfg.idle_spins;
        let mut spins = 0;

        while !refs.is_zero() {
            if worker.run_once() {
                spins = 0;
            } else if spins < idle_spins {
                spins += 1;
                hint::spin_loop();
            } else if let Some(waiters) = self.root_cell.waiters() {
                waiters.park_until(WAIT_PARK_TIMEOUT, || refs.is_zero());
                spins = 0;
            }
        }
    }

    /// Requests cancellation of every task of the group that has not started
    /// yet, and of the groups bound to it.
    pub fn cancel(&self) {
        self.context.cancel();
    }

    pub fn is_canceling(&self) -> bool {
        self.context.is_cancelled()
    }

    /// Number of submissions that did not finish yet.
    pub fn pending(&self) -> u64 {
        self.root_cell.refs.children()
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        if !self.root_cell.refs.is_zero() {
            warn!(
                pending = self.pending(),
                "task group dropped without waiting, cancelling"
            );

            self.cancel();
            if let Err(e) = self.try_wait() {
                debug!(error = %e, "discarding error of dropped task group");
            }
        }

        self.arena.shared().slab.remove(self.root);
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("root", &self.root)
            .field("pending", &self.pending())
            .field("context", &self.context)
            .finish()
    }
}
