use crate::context;
use crate::error::{Error, Result};
use crate::runtime::stealing::{Seat, Shared, ThreadPool};
use crate::runtime::{ArenaConfig, Builder, Priority};
use crate::task::{ExecutionContext, Task, TaskCell, TaskRef};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error};

/// Handle to a pool of worker threads and their scheduling state.
///
/// Handles are cheap to clone. The pool is torn down (shutdown flag, unpark,
/// join) when the last handle is dropped, including the ones held by task
/// groups.
#[derive(Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

struct ArenaInner {
    shared: Arc<Shared>,

    pool: OnceLock<ThreadPool>,

    /// Serializes pool start, so concurrent first uses converge on one pool.
    init_lock: Mutex<()>,
}

impl Arena {
    pub(crate) fn new(cfg: ArenaConfig) -> Self {
        Self {
            inner: Arc::new(ArenaInner {
                shared: Arc::new(Shared::new(cfg)),
                pool: OnceLock::new(),
                init_lock: Mutex::new(()),
            }),
        }
    }

    /// Returns a new [`Builder`].
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Builds an arena with the default configuration.
    pub fn try_default() -> anyhow::Result<Self> {
        Builder::new().try_build()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    /// Starts the worker threads if they are not running yet.
    pub fn initialize(&self) -> Result<()> {
        self.ensure_started().map(|_| ())
    }

    pub(crate) fn ensure_started(&self) -> Result<&ThreadPool> {
        if let Some(pool) = self.inner.pool.get() {
            return Ok(pool);
        }

        let _guard = self.inner.init_lock.lock();
        if let Some(pool) = self.inner.pool.get() {
            return Ok(pool);
        }

        // A failed start shuts the arena down for good.
        if self.inner.shared.is_shutdown() {
            return Err(Error::Shutdown);
        }

        let pool = ThreadPool::start(&self.inner.shared)?;
        Ok(self.inner.pool.get_or_init(|| pool))
    }

    /// Whether the worker threads were started.
    pub fn is_initialized(&self) -> bool {
        self.inner.pool.get().is_some()
    }

    /// Runs `f` on the calling thread as a participant of this arena. Tasks
    /// spawned by `f` land on the caller's deque, and waits inside `f`
    /// contribute to this arena's work.
    pub fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R,
    {
        self.ensure_started()?;
        let _enter = context::enter(self.shared(), Seat::External);
        Ok(f())
    }

    /// Submits fire-and-forget work at the arena's default priority. Panics
    /// are logged and otherwise swallowed.
    pub fn enqueue<F>(&self, f: F) -> Result<TaskRef>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue_with_priority(f, self.shared().cfg.priority)
    }

    pub fn enqueue_with_priority<F>(&self, f: F, priority: Priority) -> Result<TaskRef>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_started()?;

        let shared = self.shared();
        let task = shared.slab.insert(TaskCell::new_heap(
            Box::new(Detached(Some(f))),
            None,
            Arc::clone(&shared.enqueue_context),
        ))?;

        shared.inject(task, priority);
        shared.notify_one();
        Ok(task)
    }

    /// Worker slots plus reserved slots.
    pub fn current_concurrency(&self) -> usize {
        self.shared().cfg.num_slots()
    }

    pub fn stats(&self) -> ArenaStats {
        let shared = self.shared();

        ArenaStats {
            executed: shared.stats.executed.load(Ordering::Relaxed),
            stolen: shared.stats.stolen.load(Ordering::Relaxed),
            bypassed: shared.stats.bypassed.load(Ordering::Relaxed),
            parks: shared.stats.parks.load(Ordering::Relaxed),
            parked_workers: shared.num_parked(),
            live_tasks: shared.slab.len(),
            live_heap_tasks: shared.slab.heap_len(),
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("concurrency", &self.current_concurrency())
            .field("initialized", &self.is_initialized())
            .field("tasks", &self.shared().slab)
            .finish()
    }
}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        self.shared.shutdown();

        if let Some(pool) = self.pool.get() {
            debug!(workers = pool.len(), "joining arena workers");
            if let Err(e) = pool.join_all() {
                error!(error = %e, "error during arena shutdown");
            }
        }
    }
}

/// Snapshot of an arena's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaStats {
    /// Task executions, resumptions and re-runs included.
    pub executed: u64,

    /// Successful steals from another slot's deque.
    pub stolen: u64,

    /// Tasks executed inline through bypass.
    pub bypassed: u64,

    /// Number of times a worker went to sleep.
    pub parks: u64,

    pub parked_workers: usize,

    /// Tasks in the slab, root sentinels included.
    pub live_tasks: usize,

    /// Tasks the scheduler still has to free.
    pub live_heap_tasks: usize,
}

/// Body of `Arena::enqueue` work. Nobody waits on it, so a panic has nowhere
/// to surface but the log.
struct Detached<F>(Option<F>);

impl<F> Task for Detached<F>
where
    F: FnOnce() + Send + 'static,
{
    fn execute(&mut self, cx: &mut ExecutionContext<'_>) -> Option<TaskRef> {
        if let Some(f) = self.0.take()
            && let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f))
        {
            let panic = crate::error::TaskPanic::new(payload);
            error!(task = %cx.current(), message = panic.message(), "enqueued task panicked");
        }

        None
    }
}

/// Queries about the arena the current thread participates in.
pub mod this_arena {
    use crate::context;

    /// Slot index of the current thread in its arena, `None` outside of an
    /// arena or when the thread participates without a slot.
    pub fn current_thread_index() -> Option<usize> {
        context::current_worker().and_then(|worker| worker.slot())
    }

    /// Concurrency of the arena the current thread participates in.
    pub fn max_concurrency() -> Option<usize> {
        context::current_worker().map(|worker| worker.shared().cfg.num_slots())
    }
}
