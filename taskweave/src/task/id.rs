use crate::context;
use std::fmt;
use std::num::{NonZeroU32, NonZeroU64};
use std::sync::atomic::{AtomicU32, Ordering};

/// A generational handle to a task stored in an arena's task slab.
///
/// Handles are `Copy` and never own the task. Parent links, deque entries
/// and bypass results are all expressed as `TaskRef`s. Once a task is freed
/// its slot may be reused, but with a different generation, so an old handle
/// resolves to nothing instead of to an unrelated task.
#[derive(Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct TaskRef {
    index: u32,
    generation: NonZeroU32,
}

impl TaskRef {
    pub(crate) fn new(index: u32, generation: NonZeroU32) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(&self) -> NonZeroU32 {
        self.generation
    }

    /// Packs the handle in a single non-zero word, so that an `AtomicU64`
    /// with `0` meaning "none" can store an `Option<TaskRef>`.
    pub(crate) fn to_bits(self) -> NonZeroU64 {
        let bits = (u64::from(self.generation.get()) << 32) | u64::from(self.index);

        // The generation is non-zero and occupies the high half, so the packed word never is.
        NonZeroU64::new(bits).unwrap_or_else(|| unreachable!("generation is non-zero"))
    }

    pub(crate) fn from_bits(bits: u64) -> Option<Self> {
        let generation = NonZeroU32::new((bits >> 32) as u32)?;

        Some(Self {
            index: bits as u32,
            generation,
        })
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskRef({}#{})", self.index, self.generation)
    }
}

/// Returns the [`TaskRef`] of the task currently executing on this thread,
/// or `None` if called outside of a task body.
pub fn current_task() -> Option<TaskRef> {
    context::current_task().map(|(task, _)| task)
}

/// Source of slot generations, shared by every slab in the process.
pub(crate) fn next_generation() -> NonZeroU32 {
    static COUNTER: AtomicU32 = AtomicU32::new(1);

    loop {
        // Wrapping is fine: a stale handle would need to survive 4 billion
        // allocations to alias a new task on the same slot.
        let generation = COUNTER.fetch_add(1, Ordering::Relaxed);
        if let Some(generation) = NonZeroU32::new(generation) {
            return generation;
        }
    }
}
