use crate::context;
use crate::runtime::global_control;
use crate::runtime::stealing::{Seat, Shared};
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use crate::task::{TaskRef, harness};
use crossbeam_deque::{Steal, Stealer, Worker as CbWorker};
use std::cell::{Cell, RefCell};
use std::hint;
use std::iter;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// How often a worker idled by a global control re-checks the limit.
const CAPPED_PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// A participant of an arena: a dedicated pool thread, or an external thread
/// inside `Arena::execute` / `TaskGroup::wait`. Lives in thread-local storage
/// for as long as the thread participates.
#[derive(Debug)]
pub(crate) struct Worker {
    shared: Arc<Shared>,

    /// `None` for external threads that found every reserved slot taken.
    slot: Option<usize>,

    /// Owner end of the slot's deque. Handed back on drop.
    local: Option<CbWorker<TaskRef>>,

    /// Handle to all of the other slots' deques.
    stealers: Vec<Stealer<TaskRef>>,

    ticker: RefCell<Ticker>,

    cfg: RefCell<EventLoopConfig>,

    /// Whether we should look in the injectors before the local deque.
    pop_global_queue: Cell<bool>,
}

impl Worker {
    pub(crate) fn new(shared: &Arc<Shared>, seat: Seat) -> Self {
        let (slot, local) = match shared.claim_slot(seat) {
            Some((slot, local)) => (Some(slot), Some(local)),
            None => (None, None),
        };

        let mut stealers = shared
            .slots
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != slot)
            .map(|(_, s)| s.stealer.clone())
            .collect::<Vec<_>>();

        // Shuffle the stealers so that each worker's search order when trying to
        // steal work is different and hopefully unique to reduce contention.
        fastrand::shuffle(&mut stealers);

        Self {
            shared: Arc::clone(shared),
            slot,
            local,
            stealers,
            ticker: RefCell::new(Ticker::new()),
            cfg: RefCell::new(EventLoopConfig::from(shared.as_ref())),
            pop_global_queue: Cell::new(false),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub(crate) fn push(&self, task: TaskRef) {
        match &self.local {
            Some(local) => local.push(task),
            None => self.shared.inject(task, self.shared.cfg.priority),
        }
    }

    pub(crate) fn find_task(&self) -> Option<TaskRef> {
        // Enforce scheduler fairness by force-checking the injectors with
        // frequency `global_queue_interval`.
        if self.pop_global_queue.replace(false)
            && let Some(task) = self.shared.injectors.steal(self.local.as_ref()).success()
        {
            return Some(task);
        }

        // 1. Local deque, LIFO so the cache is hot.
        self.local.as_ref().and_then(CbWorker::pop).or_else(|| {
            // 2. No local work, repeatedly try the injectors and other slots.
            iter::repeat_with(|| {
                self.shared
                    .injectors
                    .steal(self.local.as_ref())
                    .or_else(|| self.steal_from_others())
            })
            // Repeat a maximum of `max_steal_retries` otherwise return None.
            .take(self.shared.cfg.max_steal_retries)
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
        })
    }

    fn steal_from_others(&self) -> Steal<TaskRef> {
        // The behavior of collect here is to return the first Success(T) so
        // *we are not* iterating through all stealers everytime.
        let stolen = self
            .stealers
            .iter()
            .map(|s| match &self.local {
                Some(local) => s.steal_batch_and_pop(local),
                None => s.steal(),
            })
            .collect::<Steal<_>>();

        if stolen.is_success() {
            self.shared.stats.stolen.fetch_add(1, Ordering::Relaxed);
            trace!(slot = ?self.slot, "stole task");
        }

        stolen
    }

    /// Runs one task (and its bypass chain) if any can be found.
    pub(crate) fn run_once(&self) -> bool {
        match self.find_task() {
            Some(task) => {
                harness::run(&self.shared, task);
                true
            }
            None => false,
        }
    }

    fn tick(&self) -> TickerEvents {
        self.ticker
            .borrow_mut()
            .tick(self.shared.as_ref(), &mut *self.cfg.borrow_mut())
    }

    #[inline(always)]
    fn process_ticker_events(&self, events: TickerEvents) -> ControlFlow<()> {
        if events.contains(TickerEvents::SHUTDOWN) {
            return ControlFlow::Break(());
        }

        if events.contains(TickerEvents::POP_GLOBAL_QUEUE) {
            self.pop_global_queue.set(true);
        }

        ControlFlow::Continue(())
    }

    /// Event loop of a dedicated worker.
    pub(crate) fn event_loop(&self) {
        let Some(slot) = self.slot else {
            debug_assert!(false, "event loop requires a dedicated slot");
            return;
        };

        let idle_spins = self.shared.cfg.idle_spins;
        let mut spins = 0;

        'event_loop: loop {
            if !global_control::allows_worker(slot) {
                // Capped by a global control. Stay off the parked list so
                // producers keep waking workers that may run.
                thread::park_timeout(CAPPED_PARK_TIMEOUT);
                spins = 0;
            } else if self.run_once() {
                spins = 0;
            } else if spins < idle_spins {
                spins += 1;
                hint::spin_loop();
            } else {
                // Park the thread, and wait for new tasks to be scheduled and
                // an unpark signal from a producer.
                self.shared.park_current_thread(slot);
                spins = 0;
            }

            let events = self.tick();
            if let ControlFlow::Break(_) = self.process_ticker_events(events) {
                break 'event_loop;
            }
        }

        debug!(slot, "worker exiting event loop");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let (Some(slot), Some(local)) = (self.slot, self.local.take()) {
            self.shared.release_slot(slot, local);
        }
    }
}

/// Entry point of a pool thread.
pub(crate) fn run_dedicated(shared: Arc<Shared>, slot: usize) {
    let _enter = context::enter(&shared, Seat::Dedicated(slot));

    match context::current_worker() {
        Some(worker) if worker.slot() == Some(slot) => {
            debug!(slot, "worker started");
            worker.event_loop();
        }
        _ => debug_assert!(false, "dedicated slot {slot} already taken"),
    }
}

#[derive(Debug, Clone)]
struct EventLoopConfig {
    global_queue_interval: u32,
}

impl EventLoopConfig {
    #[inline(always)]
    fn should_pop_global_queue(&self, tick: u32) -> bool {
        tick.is_multiple_of(self.global_queue_interval)
    }
}

impl From<&Shared> for EventLoopConfig {
    fn from(shared: &Shared) -> EventLoopConfig {
        EventLoopConfig {
            global_queue_interval: shared.cfg.global_queue_interval,
        }
    }
}

impl TickerData for EventLoopConfig {
    type Context = Shared;

    #[inline(always)]
    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents {
        // Fast-path to enforce shutdown
        if ctx.is_shutdown() {
            return TickerEvents::SHUTDOWN;
        }

        let mut events = TickerEvents::empty();

        if self.should_pop_global_queue(tick) {
            events.insert(TickerEvents::POP_GLOBAL_QUEUE);
        }

        events
    }
}
