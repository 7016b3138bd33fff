use crate::runtime::Arena;
use anyhow::{Result, anyhow, bail};
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Global queue interval default value.
const GLOBAL_QUEUE_INTERVAL: u32 = 31;

/// Maximum number of stealing attempts.
const MAX_STEAL_RETRIES: usize = 3;

/// Spin iterations before an idle worker parks.
const IDLE_SPINS: u32 = 64;

/// Slots for threads that are not part of the pool.
const RESERVED_SLOTS: usize = 1;

/// Default bound of the task slab.
const MAX_TASKS: usize = 1 << 22;

/// Scheduling priority of submissions coming from outside the arena.
///
/// Priorities are advisory: they select the injector queue, and workers
/// always drain `High` before `Normal` before `Low`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub(crate) const COUNT: usize = 3;

    /// Index of the injector queue, in draining order.
    pub(crate) fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

#[derive(Clone)]
pub(crate) struct ThreadNameFn(Arc<dyn Fn() -> String + Send + Sync + 'static>);

impl ThreadNameFn {
    pub(crate) fn next_name(&self) -> String {
        (self.0)()
    }
}

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("taskweave-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// Total number of slots, dedicated and reserved. Takes precedence over
    /// the default worker count.
    max_concurrency: Option<usize>,

    /// The number of dedicated worker threads. Defaults to one per core,
    /// minus the reserved slots.
    worker_threads: Option<usize>,

    /// Slots available to threads outside the pool that submit or wait.
    reserved_slots: usize,

    /// Injector used for submissions from non participants.
    priority: Priority,

    /// Name fn used for threads spawned by the arena.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the arena.
    thread_stack_size: Option<usize>,

    /// How many ticks before pulling a task from the injector queues.
    global_queue_interval: u32,

    /// How many times a worker will loop over the injectors and other slots'
    /// deques to try and find work before idling.
    max_steal_retries: usize,

    /// How many empty searches a worker spins through before parking.
    idle_spins: u32,

    /// Bound of the task slab.
    max_tasks: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            max_concurrency: None,
            worker_threads: None,
            reserved_slots: RESERVED_SLOTS,
            priority: Priority::default(),
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
            max_steal_retries: MAX_STEAL_RETRIES,
            idle_spins: IDLE_SPINS,
            max_tasks: MAX_TASKS,
        }
    }

    /// Total concurrency of the arena: dedicated workers plus reserved slots.
    /// The number of workers becomes `val - reserved_slots`.
    #[track_caller]
    pub fn max_concurrency(mut self, val: usize) -> Self {
        assert!(val > 0, "max_concurrency must be greater than 0");
        self.max_concurrency = Some(val);
        self
    }

    /// The number of dedicated worker threads. Zero is allowed, in which case
    /// all work runs on the threads that wait.
    pub fn worker_threads(mut self, val: usize) -> Self {
        self.worker_threads = Some(val);
        self
    }

    #[track_caller]
    pub fn reserved_slots(mut self, val: usize) -> Self {
        assert!(val > 0, "reserved_slots must be greater than 0");
        self.reserved_slots = val;
        self
    }

    pub fn priority(mut self, val: Priority) -> Self {
        self.priority = val;
        self
    }

    /// Sets name of threads spawned by the arena's thread pool.
    ///
    /// The default name is "taskweave-{id}", where id is monotonically
    /// increasing.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// arena's thread pool.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(val > 0, "thread_stack_size must be greater than 0");
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets the number of scheduler ticks after which a worker looks in the
    /// injector queues before its own deque.
    ///
    /// Setting the interval to `1` will prioritize the injectors, a higher
    /// value prioritizes work already claimed locally.
    #[track_caller]
    pub fn global_queue_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "global_queue_interval must be greater than 0");
        self.global_queue_interval = val;
        self
    }

    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    pub fn idle_spins(mut self, val: u32) -> Self {
        self.idle_spins = val;
        self
    }

    #[track_caller]
    pub fn max_tasks(mut self, val: usize) -> Self {
        assert!(val > 0, "max_tasks must be greater than 0");
        self.max_tasks = val;
        self
    }

    /// Creates the configured `Arena`.
    ///
    /// Worker threads are started lazily, on first use or through
    /// [`Arena::initialize`].
    pub fn try_build(self) -> Result<Arena> {
        let cfg = ArenaConfig::try_from(self)?;
        Ok(Arena::new(cfg))
    }
}

// Export builder as an ArenaConfig object to be consumed by the scheduler.
#[derive(Debug, Clone)]
pub(crate) struct ArenaConfig {
    pub(crate) worker_threads: usize,
    pub(crate) reserved_slots: usize,
    pub(crate) priority: Priority,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) global_queue_interval: u32,
    pub(crate) max_steal_retries: usize,
    pub(crate) idle_spins: u32,
    pub(crate) max_tasks: usize,
}

impl ArenaConfig {
    pub(crate) fn num_slots(&self) -> usize {
        self.worker_threads + self.reserved_slots
    }

    fn validate(&self) -> Result<()> {
        if u32::try_from(self.max_tasks).is_err() {
            bail!("max_tasks ({}) must fit in 32 bits", self.max_tasks);
        }

        Ok(())
    }
}

impl TryFrom<Builder> for ArenaConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let reserved = builder.reserved_slots;

        let worker_threads = match (builder.max_concurrency, builder.worker_threads) {
            (Some(max), Some(workers)) if workers + reserved != max => {
                return Err(anyhow!(
                    "worker_threads ({workers}) + reserved_slots ({reserved}) != max_concurrency ({max})"
                ));
            }
            (_, Some(workers)) => workers,
            (Some(max), None) => max.saturating_sub(reserved),
            (None, None) => thread::available_parallelism()?
                .get()
                .saturating_sub(reserved),
        };

        let cfg = ArenaConfig {
            worker_threads,
            reserved_slots: reserved,
            priority: builder.priority,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            global_queue_interval: builder.global_queue_interval,
            max_steal_retries: builder.max_steal_retries,
            idle_spins: builder.idle_spins,
            max_tasks: builder.max_tasks,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    // Cloned into every worker through `Shared`.
    assert_impl_all!(ArenaConfig: Send, Sync, Clone);

    #[rstest]
    #[case::one(1, 1, 0)]
    #[case::four(4, 1, 3)]
    #[case::two_reserved(4, 2, 2)]
    fn test_max_concurrency_splits_slots(
        #[case] max: usize,
        #[case] reserved: usize,
        #[case] workers: usize,
    ) -> Result<()> {
        let cfg = ArenaConfig::try_from(
            Builder::new()
                .max_concurrency(max)
                .reserved_slots(reserved),
        )?;

        assert_eq!(cfg.worker_threads, workers);
        assert_eq!(cfg.num_slots(), max);
        Ok(())
    }

    #[test]
    fn test_conflicting_sizes_rejected() {
        let res = ArenaConfig::try_from(Builder::new().max_concurrency(4).worker_threads(8));
        assert!(res.is_err());
    }

    #[test]
    fn test_default_thread_names() {
        let name = default_thread_name_fn();
        assert_eq!(name.next_name(), "taskweave-0");
        assert_eq!(name.next_name(), "taskweave-1");

        let cfg = Builder::new().thread_name("pinned").thread_name;
        assert_eq!(cfg.next_name(), "pinned");
    }

    #[test]
    #[should_panic(expected = "global_queue_interval must be greater than 0")]
    fn test_zero_interval_panics() {
        let _ = Builder::new().global_queue_interval(0);
    }

    #[test]
    fn test_priority_draining_order() {
        let mut all = [Priority::Low, Priority::High, Priority::Normal];
        all.sort_by_key(|p| p.index());
        assert_eq!(all, [Priority::High, Priority::Normal, Priority::Low]);
    }
}
