use crate::runtime::Priority;
use crate::task::TaskRef;
use crossbeam_deque::{Injector, Steal, Stealer, Worker as CbWorker};
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;

/// One injector queue per priority level, drained high to low.
#[derive(Debug)]
pub(crate) struct Injectors {
    queues: [Injector<TaskRef>; Priority::COUNT],
}

impl Injectors {
    pub(crate) fn new() -> Self {
        Self {
            queues: [Injector::new(), Injector::new(), Injector::new()],
        }
    }

    pub(crate) fn push(&self, task: TaskRef, priority: Priority) {
        self.queues[priority.index()].push(task);
    }

    /// Steals from the highest priority injector that has work. A batch is
    /// moved into `local` when the caller owns a deque.
    pub(crate) fn steal(&self, local: Option<&CbWorker<TaskRef>>) -> Steal<TaskRef> {
        // `Steal: FromIterator` stops at the first success, and reports
        // `Retry` if any queue lost a race.
        self.queues
            .iter()
            .map(|injector| match local {
                Some(local) => injector.steal_batch_and_pop(local),
                None => injector.steal(),
            })
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queues.iter().all(Injector::is_empty)
    }

    pub(crate) fn len(&self) -> usize {
        self.queues.iter().map(Injector::len).sum()
    }
}

/// An arena seat. The deque is checked out by whichever thread occupies the
/// slot, the stealer stays shared so thieves can reach it either way.
#[derive(Debug)]
pub(crate) struct Slot {
    local: Mutex<Option<CbWorker<TaskRef>>>,

    pub(crate) stealer: Stealer<TaskRef>,

    /// Set by the unparking thread, guards against spurious wakeups.
    pub(crate) should_unpark: AtomicBool,
}

impl Slot {
    pub(crate) fn new() -> Self {
        let local = CbWorker::new_lifo();

        Self {
            stealer: local.stealer(),
            local: Mutex::new(Some(local)),
            should_unpark: AtomicBool::new(false),
        }
    }

    /// Takes the deque out. Returns `None` if the slot is occupied.
    pub(crate) fn claim(&self) -> Option<CbWorker<TaskRef>> {
        self.local.lock().take()
    }

    pub(crate) fn release(&self, local: CbWorker<TaskRef>) {
        let prev = self.local.lock().replace(local);
        debug_assert!(prev.is_none(), "slot released twice");
    }
}
