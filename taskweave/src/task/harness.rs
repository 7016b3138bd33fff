use crate::context::{self, TaskGuard};
use crate::error::TaskPanic;
use crate::runtime::stealing::Shared;
use crate::task::{Allocation, ExecutionContext, State, Task, TaskCell, TaskRef};
use smallvec::SmallVec;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{trace, warn};

/// Runs `task` and then every task it bypasses into, until the chain ends.
pub(crate) fn run(shared: &Arc<Shared>, task: TaskRef) {
    let mut next = Some(task);

    while let Some(task) = next {
        next = run_one(shared, task);
        if next.is_some() {
            shared.stats.bypassed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Executes a single task and settles its reference counts. Returns the task
/// to execute next on this thread, if any.
pub(crate) fn run_one(shared: &Arc<Shared>, task: TaskRef) -> Option<TaskRef> {
    let Some(cell) = shared.slab.get(task) else {
        warn!(%task, "stale task reference, skipping");
        return None;
    };

    let prev = match cell.state.begin_execution() {
        Ok(prev) => prev,
        Err(e) => {
            warn!(%task, error = %e, "task is not runnable, skipping");
            return None;
        }
    };

    // Resumed continuations start with a zero word, take the execution
    // reference back.
    let resumed = prev == State::Continuation;
    if resumed {
        cell.refs.add_self_ref();
    }

    shared.stats.executed.fetch_add(1, Ordering::Relaxed);

    let Some(mut body) = cell.take_body() else {
        warn!(%task, "task has no body, completing");
        return complete(shared, task, &cell, None);
    };

    let mut cx = ExecutionContext::new(shared, task, &cell, resumed);
    let mut bypass = {
        let _guard = TaskGuard::enter(task, Arc::clone(&cell.group));
        invoke(&mut *body, &mut cx, &cell)
    };
    let armed = cx.take_armed();
    drop(cx);

    let state = cell.state.load();
    if bypass == Some(task) && state != State::RecycledAsChild {
        warn!(%task, ?state, "task returned itself without recycling as child");
        bypass = None;
    }

    let mut ready: SmallVec<[TaskRef; 4]> = SmallVec::new();
    let mut recycled = None;

    match state {
        State::Executing => {
            if let Some(parent) = complete(shared, task, &cell, Some(body)) {
                ready.push(parent);
            }
        }
        State::Continuation => {
            cell.put_body(body);

            // A recycle hold in `armed` keeps the word alive. A suspend
            // point resumed while `execute` was still running does not.
            if cell.refs.release_self_ref() {
                ready.push(task);
            }
        }
        State::RecycledAsChild => {
            cell.put_body(body);
            if bypass != Some(task) {
                recycled = Some(task);
            }
        }
        State::Fresh | State::Completed => {
            unreachable!("task {task} left execute() in state {state:?}")
        }
    }

    for held in armed {
        if let Some(held_cell) = shared.slab.get(held)
            && held_cell.refs.release_self_ref()
        {
            ready.push(held);
        }
    }

    let mut candidates = bypass.into_iter().chain(ready).chain(recycled);
    let next = candidates.next();
    for task in candidates {
        context::push(shared, task);
    }

    next
}

fn invoke(body: &mut dyn Task, cx: &mut ExecutionContext<'_>, cell: &TaskCell) -> Option<TaskRef> {
    let cancelled = cell.group.is_cancelled();

    let res = panic::catch_unwind(AssertUnwindSafe(|| {
        if cancelled {
            body.cancel(cx);
            None
        } else {
            body.execute(cx)
        }
    }));

    match res {
        Ok(bypass) => bypass,
        Err(payload) => {
            let panic = TaskPanic::new(payload);
            trace!(task = %cx.current(), message = panic.message(), "task panicked");
            cell.group.register_panic(panic);
            cx.unwind();
            None
        }
    }
}

/// Marks the task completed, drops its body, releases the execution
/// reference and then the parent's child count. Returns the parent if it
/// became ready to run.
fn complete(
    shared: &Arc<Shared>,
    task: TaskRef,
    cell: &TaskCell,
    body: Option<Box<dyn Task>>,
) -> Option<TaskRef> {
    if let Err(e) = cell.state.transition(State::Executing, State::Completed) {
        warn!(%task, error = %e, "failed to complete task");
    }

    drop(body);
    let parent = cell.parent();

    if cell.refs.release_self_ref() && cell.allocation == Allocation::Heap {
        shared.slab.remove(task);
    }

    parent.and_then(|parent| release_parent(shared, parent))
}

/// Decrements a parent's outstanding children. Returns the parent when it is
/// a continuation that just became ready.
pub(crate) fn release_parent(shared: &Shared, parent: TaskRef) -> Option<TaskRef> {
    let Some(cell) = shared.slab.get(parent) else {
        warn!(%parent, "stale parent reference, child count not released");
        return None;
    };

    if !cell.refs.release_child() {
        return None;
    }

    if let Some(waiters) = cell.waiters() {
        waiters.notify_all();
        return None;
    }

    match cell.state.load() {
        State::Continuation => Some(parent),
        State::Completed => {
            if cell.allocation == Allocation::Heap {
                shared.slab.remove(parent);
            }
            None
        }
        state => {
            warn!(%parent, ?state, "reference word reached zero in unexpected state");
            None
        }
    }
}
