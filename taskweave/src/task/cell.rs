use crate::group::GroupContext;
use crate::task::state::{AtomicState, RefCount};
use crate::task::{State, Task, TaskRef};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, Thread};
use std::time::Duration;

/// Who is responsible for removing the task from the slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Allocation {
    /// Freed by the scheduler when the reference word reaches zero after
    /// completion.
    Heap,

    /// Owned by the front-door object that created it (root sentinels and
    /// tasks run inline by `run_and_wait`). Never recycled, never freed by
    /// the scheduler.
    Stack,
}

/// Storage for one task in the slab.
pub(crate) struct TaskCell {
    pub(crate) refs: RefCount,

    pub(crate) state: AtomicState,

    pub(crate) allocation: Allocation,

    /// Packed `Option<TaskRef>`, `0` is `None`.
    parent: AtomicU64,

    /// Cancellation context the task runs under.
    pub(crate) group: Arc<GroupContext>,

    /// Taken out for the duration of `execute()`. `None` once completed.
    body: Mutex<Option<Box<dyn Task>>>,

    /// Only set on root sentinels: threads blocked in `wait()`.
    waiters: Option<Waiters>,
}

impl TaskCell {
    pub(crate) fn new_heap(
        body: Box<dyn Task>,
        parent: Option<TaskRef>,
        group: Arc<GroupContext>,
    ) -> Self {
        Self::new(Allocation::Heap, State::Fresh, 1, 0, Some(body), parent, group, None)
    }

    /// A continuation waits for `children` and holds one self-reference until
    /// its creator's `execute()` returns.
    pub(crate) fn new_continuation(
        body: Box<dyn Task>,
        parent: Option<TaskRef>,
        children: u64,
        group: Arc<GroupContext>,
    ) -> Self {
        Self::new(
            Allocation::Heap,
            State::Continuation,
            1,
            children,
            Some(body),
            parent,
            group,
            None,
        )
    }

    pub(crate) fn new_stack(
        body: Box<dyn Task>,
        parent: Option<TaskRef>,
        group: Arc<GroupContext>,
    ) -> Self {
        Self::new(Allocation::Stack, State::Fresh, 1, 0, Some(body), parent, group, None)
    }

    /// Root sentinel of a task group. It has no body and no self reference:
    /// the word is exactly the number of outstanding submissions.
    pub(crate) fn new_root(group: Arc<GroupContext>) -> Self {
        Self::new(
            Allocation::Stack,
            State::Continuation,
            0,
            0,
            None,
            None,
            group,
            Some(Waiters::default()),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        allocation: Allocation,
        state: State,
        self_refs: u64,
        children: u64,
        body: Option<Box<dyn Task>>,
        parent: Option<TaskRef>,
        group: Arc<GroupContext>,
        waiters: Option<Waiters>,
    ) -> Self {
        Self {
            refs: RefCount::new(self_refs, children),
            state: AtomicState::new(state),
            allocation,
            parent: AtomicU64::new(parent.map_or(0, |p| p.to_bits().get())),
            group,
            body: Mutex::new(body),
            waiters,
        }
    }

    pub(crate) fn parent(&self) -> Option<TaskRef> {
        TaskRef::from_bits(self.parent.load(Ordering::Acquire))
    }

    pub(crate) fn set_parent(&self, parent: Option<TaskRef>) -> Option<TaskRef> {
        let bits = parent.map_or(0, |p| p.to_bits().get());
        TaskRef::from_bits(self.parent.swap(bits, Ordering::AcqRel))
    }

    pub(crate) fn take_body(&self) -> Option<Box<dyn Task>> {
        self.body.lock().take()
    }

    pub(crate) fn put_body(&self, body: Box<dyn Task>) {
        let prev = self.body.lock().replace(body);
        debug_assert!(prev.is_none(), "task body stored twice");
    }

    pub(crate) fn is_root(&self) -> bool {
        self.waiters.is_some()
    }

    pub(crate) fn waiters(&self) -> Option<&Waiters> {
        self.waiters.as_ref()
    }
}

impl fmt::Debug for TaskCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCell")
            .field("state", &self.state.load())
            .field("allocation", &self.allocation)
            .field("self_refs", &self.refs.self_refs())
            .field("children", &self.refs.children())
            .field("parent", &self.parent())
            .field("is_root", &self.is_root())
            .finish()
    }
}

/// Threads blocked on a root sentinel reaching zero.
#[derive(Debug, Default)]
pub(crate) struct Waiters {
    threads: Mutex<SmallVec<[Thread; 1]>>,
}

impl Waiters {
    /// Parks the current thread until notified, or until `timeout` elapses.
    /// The `done` check runs after registration so a notification between
    /// the caller's last check and the park is never lost.
    pub(crate) fn park_until<F>(&self, timeout: Duration, done: F)
    where
        F: Fn() -> bool,
    {
        let me = thread::current();
        self.threads.lock().push(me.clone());

        if !done() {
            thread::park_timeout(timeout);
        }

        let mut threads = self.threads.lock();
        if let Some(pos) = threads.iter().position(|t| t.id() == me.id()) {
            threads.swap_remove(pos);
        }
    }

    pub(crate) fn notify_all(&self) {
        for thread in self.threads.lock().iter() {
            thread.unpark();
        }
    }
}
