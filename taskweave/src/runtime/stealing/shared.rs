use crate::group::{ContextKind, GroupContext};
use crate::runtime::stealing::queue::{Injectors, Slot};
use crate::runtime::{ArenaConfig, Priority};
use crate::task::{TaskRef, TaskSlab};
use crossbeam_deque::Worker as CbWorker;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, Thread};
use tracing::trace;

/// How a thread occupies the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Seat {
    /// Pool thread bound to its slot for its whole life.
    Dedicated(usize),

    /// Submitting or waiting thread, takes any free reserved slot.
    External,
}

/// State shared by every participant of an arena.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) cfg: ArenaConfig,

    pub(crate) slab: TaskSlab,

    pub(crate) injectors: Injectors,

    /// `worker_threads` dedicated slots followed by `reserved_slots` slots
    /// for external threads.
    pub(crate) slots: Box<[Slot]>,

    pub(crate) shutdown: AtomicBool,

    /// Context of fire-and-forget work submitted through `Arena::enqueue`.
    pub(crate) enqueue_context: Arc<GroupContext>,

    pub(crate) stats: Stats,

    /// LIFO collection of parked workers and their slot. We unpark in LIFO
    /// order as the latest parked thread is the one where CPU cache will be
    /// the hotest.
    parked_threads: RwLock<VecDeque<(Thread, usize)>>,

    /// Mirrors `parked_threads.len()` so producers can skip the lock.
    num_parked: AtomicUsize,
}

impl Shared {
    pub(crate) fn new(cfg: ArenaConfig) -> Self {
        let slots = (0..cfg.num_slots()).map(|_| Slot::new()).collect();

        Self {
            slab: TaskSlab::new(cfg.max_tasks),
            injectors: Injectors::new(),
            slots,
            shutdown: AtomicBool::new(false),
            enqueue_context: GroupContext::new(ContextKind::Isolated),
            stats: Stats::default(),
            parked_threads: RwLock::new(VecDeque::with_capacity(cfg.worker_threads)),
            num_parked: AtomicUsize::new(0),
            cfg,
        }
    }

    /// Takes a slot for `seat`. External threads get `None` when every
    /// reserved slot is taken, they then only go through the injectors.
    pub(crate) fn claim_slot(&self, seat: Seat) -> Option<(usize, CbWorker<TaskRef>)> {
        match seat {
            Seat::Dedicated(slot) => self.slots[slot].claim().map(|local| (slot, local)),
            Seat::External => (self.cfg.worker_threads..self.slots.len())
                .find_map(|slot| self.slots[slot].claim().map(|local| (slot, local))),
        }
    }

    pub(crate) fn release_slot(&self, slot: usize, local: CbWorker<TaskRef>) {
        let has_leftovers = !local.is_empty();
        self.slots[slot].release(local);

        // Leftovers stay stealable, make sure someone comes looking.
        if has_leftovers {
            self.notify_one();
        }
    }

    pub(crate) fn inject(&self, task: TaskRef, priority: Priority) {
        self.injectors.push(task, priority);
    }

    pub(crate) fn has_work(&self) -> bool {
        !self.injectors.is_empty() || self.slots.iter().any(|slot| !slot.stealer.is_empty())
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn num_parked(&self) -> usize {
        self.num_parked.load(Ordering::SeqCst)
    }

    /// Parks the current worker until a producer or the shutdown sequence
    /// unparks it.
    pub(crate) fn park_current_thread(&self, slot: usize) {
        {
            let mut parked_threads = self.parked_threads.write();

            // Announce ourselves *before* the final check. Producers publish
            // work and then read `num_parked`, so either they see us or we see
            // their work.
            self.num_parked.fetch_add(1, Ordering::SeqCst);
            atomic::fence(Ordering::SeqCst);

            if self.has_work() || self.is_shutdown() {
                self.num_parked.fetch_sub(1, Ordering::SeqCst);
                return;
            }

            self.slots[slot].should_unpark.store(false, Ordering::Release);
            parked_threads.push_back((thread::current(), slot));
        }

        trace!(slot, "worker parked");
        self.stats.parks.fetch_add(1, Ordering::Relaxed);

        // Loop to account for spurious wakeups as per docs.
        while !self.slots[slot].should_unpark.load(Ordering::Acquire) {
            thread::park();
        }

        trace!(slot, "worker unparked");
    }

    /// Called by producers after publishing work.
    pub(crate) fn notify_one(&self) {
        atomic::fence(Ordering::SeqCst);

        if self.num_parked.load(Ordering::SeqCst) > 0 {
            self.unpark_one_thread();
        }
    }

    pub(crate) fn unpark_one_thread(&self) -> bool {
        let Some((thread, slot)) = self.parked_threads.write().pop_back() else {
            return false;
        };

        self.num_parked.fetch_sub(1, Ordering::SeqCst);
        self.slots[slot].should_unpark.store(true, Ordering::Release);
        thread.unpark();
        true
    }

    pub(crate) fn unpark_all_threads(&self) -> usize {
        let mut num_unparked = 0;
        let mut parked_threads = self.parked_threads.write();

        while let Some((thread, slot)) = parked_threads.pop_back() {
            num_unparked += 1;
            self.num_parked.fetch_sub(1, Ordering::SeqCst);
            self.slots[slot].should_unpark.store(true, Ordering::Release);
            thread.unpark();
        }

        num_unparked
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let n = self.unpark_all_threads();
        trace!(
            unparked = n,
            abandoned = self.injectors.len(),
            "arena shutdown requested"
        );
    }
}

/// Monotonic counters, read through `Arena::stats`.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    /// Task executions, resumptions and re-runs included.
    pub(crate) executed: AtomicU64,

    pub(crate) stolen: AtomicU64,

    pub(crate) bypassed: AtomicU64,

    pub(crate) parks: AtomicU64,
}
