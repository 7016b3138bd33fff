//! Thread-local participation state.
//!
//! A thread participates in at most one arena at a time. Dedicated workers
//! enter their arena for the lifetime of the thread, external threads enter
//! it for the duration of `Arena::execute` or `TaskGroup::wait`.

use crate::group::GroupContext;
use crate::runtime::stealing::{Seat, Shared, Worker};
use crate::task::TaskRef;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread_local;

thread_local! {
    static WORKER: RefCell<Option<Rc<Worker>>> = const { RefCell::new(None) };

    static CURRENT_TASK: RefCell<Option<(TaskRef, Arc<GroupContext>)>> = const { RefCell::new(None) };
}

/// Makes the current thread a participant of `shared`'s arena until the
/// guard is dropped. Re-entering the arena the thread already participates
/// in is a no-op.
pub(crate) fn enter(shared: &Arc<Shared>, seat: Seat) -> EnterGuard {
    if current_worker().is_some_and(|w| Arc::ptr_eq(w.shared(), shared)) {
        return EnterGuard { prev: None };
    }

    let worker = Rc::new(Worker::new(shared, seat));
    let prev = WORKER.with(|cell| cell.borrow_mut().replace(worker));

    EnterGuard { prev: Some(prev) }
}

#[must_use]
pub(crate) struct EnterGuard {
    /// `None` for nested entries, which leave the thread-local untouched.
    prev: Option<Option<Rc<Worker>>>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.prev.take() {
            // Dropped outside of the borrow, the worker hands its deque back
            // to the arena.
            let _ours = WORKER.with(|cell| std::mem::replace(&mut *cell.borrow_mut(), prev));
        }
    }
}

pub(crate) fn current_worker() -> Option<Rc<Worker>> {
    WORKER.with(|cell| cell.borrow().clone())
}

/// Schedules `task` on `shared`'s arena: on the local deque when the current
/// thread holds a slot of that arena, on the injector otherwise.
pub(crate) fn push(shared: &Arc<Shared>, task: TaskRef) {
    match current_worker() {
        Some(worker) if Arc::ptr_eq(worker.shared(), shared) => worker.push(task),
        _ => shared.inject(task, shared.cfg.priority),
    }

    shared.notify_one();
}

pub(crate) fn current_task() -> Option<(TaskRef, Arc<GroupContext>)> {
    CURRENT_TASK.with(|cell| cell.borrow().clone())
}

pub(crate) fn current_group() -> Option<Arc<GroupContext>> {
    CURRENT_TASK.with(|cell| cell.borrow().as_ref().map(|(_, group)| Arc::clone(group)))
}

/// Marks a task as running on this thread. Restores the previously running
/// task on drop, which matters when a body waits on a nested group.
pub(crate) struct TaskGuard {
    prev: Option<(TaskRef, Arc<GroupContext>)>,
}

impl TaskGuard {
    pub(crate) fn enter(task: TaskRef, group: Arc<GroupContext>) -> Self {
        let prev = CURRENT_TASK.with(|cell| cell.borrow_mut().replace((task, group)));
        Self { prev }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_TASK.with(|cell| *cell.borrow_mut() = prev);
    }
}
