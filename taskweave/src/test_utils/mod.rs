use crate::runtime::{Arena, Builder};
use crate::task::{ExecutionContext, Task, TaskRef};
use anyhow::Result;
use std::sync::Once;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Arena with `worker_threads` pool threads and one reserved slot for the
/// test thread.
pub(crate) fn init_arena(worker_threads: usize, builder: Option<Builder>) -> Result<Arena> {
    init_tracing();

    let arena = builder
        .unwrap_or_default()
        .worker_threads(worker_threads)
        .try_build()?;

    Ok(arena)
}

/// Polls `cond` until it holds or `timeout` elapses.
pub(crate) fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let start = Instant::now();

    while !cond() {
        if start.elapsed() > timeout {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }

    true
}

/// Tracks bodies alive: incremented on first execution, decremented on drop.
#[derive(Debug, Default)]
pub(crate) struct LiveCounter {
    pub(crate) live: AtomicI64,
    pub(crate) executed: AtomicUsize,
}

/// Leaf body counted by a [`LiveCounter`].
pub(crate) struct Counted {
    counter: Arc<LiveCounter>,
    started: bool,
}

impl Counted {
    pub(crate) fn new(counter: &Arc<LiveCounter>) -> Self {
        Self {
            counter: Arc::clone(counter),
            started: false,
        }
    }
}

impl Task for Counted {
    fn execute(&mut self, _cx: &mut ExecutionContext<'_>) -> Option<TaskRef> {
        if !self.started {
            self.started = true;
            self.counter.live.fetch_add(1, Ordering::Relaxed);
        }
        self.counter.executed.fetch_add(1, Ordering::Relaxed);
        None
    }
}

impl Drop for Counted {
    fn drop(&mut self) {
        if self.started {
            self.counter.live.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
