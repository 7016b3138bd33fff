//! Process-wide limits shared by every arena.
//!
//! A [`GlobalControl`] is a scoped setting: it applies from its creation until
//! it is dropped. When several controls of the same [`Parameter`] are alive,
//! the most restrictive value wins.

use parking_lot::{Mutex, const_mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    /// Upper bound on the threads executing tasks of any one arena, the
    /// thread that calls into the arena included. Pool threads above the
    /// bound stay idle until the limit is lifted. The smallest value wins.
    MaxAllowedParallelism,

    /// Stack size of pool threads started while the control is alive, for
    /// arenas whose builder does not set one. The largest value wins.
    ThreadStackSize,
}

#[derive(Debug)]
struct Active {
    id: u64,
    parameter: Parameter,
    value: usize,
}

static ACTIVE: Mutex<Vec<Active>> = const_mutex(Vec::new());

/// Effective parallelism limit, read by worker loops. `0` means unlimited.
static MAX_PARALLELISM: AtomicUsize = AtomicUsize::new(0);

/// Scoped process-wide setting, lifted on drop.
#[must_use = "the setting is lifted as soon as the control is dropped"]
#[derive(Debug)]
pub struct GlobalControl {
    id: u64,
    parameter: Parameter,
    value: usize,
}

impl GlobalControl {
    #[track_caller]
    pub fn new(parameter: Parameter, value: usize) -> Self {
        assert!(value > 0, "global control value must be greater than 0");

        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

        let mut active = ACTIVE.lock();
        active.push(Active {
            id,
            parameter,
            value,
        });
        refresh(&active);

        debug!(?parameter, value, "global control activated");
        Self {
            id,
            parameter,
            value,
        }
    }

    pub fn parameter(&self) -> Parameter {
        self.parameter
    }

    pub fn value(&self) -> usize {
        self.value
    }

    /// Value currently in effect for `parameter`, `None` when no control of
    /// that kind is alive.
    pub fn active_value(parameter: Parameter) -> Option<usize> {
        effective(&ACTIVE.lock(), parameter)
    }
}

impl Drop for GlobalControl {
    fn drop(&mut self) {
        let mut active = ACTIVE.lock();
        active.retain(|a| a.id != self.id);
        refresh(&active);

        debug!(parameter = ?self.parameter, value = self.value, "global control lifted");
    }
}

fn effective(active: &[Active], parameter: Parameter) -> Option<usize> {
    let values = active
        .iter()
        .filter(|a| a.parameter == parameter)
        .map(|a| a.value);

    match parameter {
        Parameter::MaxAllowedParallelism => values.min(),
        Parameter::ThreadStackSize => values.max(),
    }
}

fn refresh(active: &[Active]) {
    let limit = effective(active, Parameter::MaxAllowedParallelism).unwrap_or(0);
    MAX_PARALLELISM.store(limit, Ordering::Release);
}

/// Whether the pool thread of dedicated `slot` may execute tasks. One unit of
/// the limit is left to the thread calling into the arena.
pub(crate) fn allows_worker(slot: usize) -> bool {
    match MAX_PARALLELISM.load(Ordering::Acquire) {
        0 => true,
        limit => slot + 1 < limit,
    }
}
