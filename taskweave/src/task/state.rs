use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Logical role of a task instance.
///
/// ```text
///   Fresh ──────────┐
///   RecycledAsChild ┼──> Executing ──> Completed
///   Continuation ───┘        │
///        ^                   ├──> Continuation     (recycle_as_continuation)
///        └───────────────────┘
///                            └──> RecycledAsChild  (recycle_as_child_of)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    /// Allocated, not executed yet.
    Fresh = 0,

    /// `execute()` or `cancel()` is running on some thread.
    Executing = 1,

    /// Waiting for its children. Re-entered once the reference word reaches
    /// zero.
    Continuation = 2,

    /// Parent was reassigned during execution, will run again as a fresh
    /// logical task.
    RecycledAsChild = 3,

    /// Done. The cell lingers only while children still reference it.
    Completed = 4,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Fresh,
            1 => State::Executing,
            2 => State::Continuation,
            3 => State::RecycledAsChild,
            4 => State::Completed,
            _ => unreachable!("invalid task state {v}"),
        }
    }

    /// States from which the scheduler may start executing the task.
    pub(crate) fn is_runnable(self) -> bool {
        matches!(
            self,
            State::Fresh | State::Continuation | State::RecycledAsChild
        )
    }
}

#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Validated transition. Fails if the current state is not `from`.
    pub(crate) fn transition(&self, from: State, to: State) -> Result<()> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| Error::InvalidTransition {
                from: State::from_u8(actual),
                to,
            })
    }

    /// Moves a runnable task to `Executing`, returning the state it came from.
    pub(crate) fn begin_execution(&self) -> Result<State> {
        let mut current = self.0.load(Ordering::Acquire);

        loop {
            let state = State::from_u8(current);
            if !state.is_runnable() {
                return Err(Error::InvalidTransition {
                    from: state,
                    to: State::Executing,
                });
            }

            match self.0.compare_exchange_weak(
                current,
                State::Executing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(state),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Unit of the self-reference field.
pub(crate) const SELF_REF_ONE: u64 = 1 << 48;

/// Mask of the outstanding-children field.
pub(crate) const CHILD_MASK: u64 = SELF_REF_ONE - 1;

/// Reference word of a task. High bits count self-references (the pending
/// execution, and holds taken while a continuation is being wired), low bits
/// count outstanding children. A word of exactly zero means "no self
/// reference and no children left".
#[derive(Debug)]
pub(crate) struct RefCount(AtomicU64);

impl RefCount {
    pub(crate) fn new(self_refs: u64, children: u64) -> Self {
        debug_assert!(children <= CHILD_MASK, "child count overflow");
        Self(AtomicU64::new(self_refs * SELF_REF_ONE + children))
    }

    pub(crate) fn add_child(&self) {
        self.add_children(1);
    }

    pub(crate) fn add_children(&self, n: u64) {
        let prev = self.0.fetch_add(n, Ordering::Relaxed);
        debug_assert!((prev & CHILD_MASK) + n <= CHILD_MASK, "child count overflow");
    }

    /// Returns true when this call brought the word to zero.
    #[track_caller]
    pub(crate) fn release_child(&self) -> bool {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & CHILD_MASK > 0, "child count underflow");
        prev == 1
    }

    pub(crate) fn add_self_ref(&self) {
        self.0.fetch_add(SELF_REF_ONE, Ordering::Relaxed);
    }

    /// Returns true when this call brought the word to zero.
    #[track_caller]
    pub(crate) fn release_self_ref(&self) -> bool {
        let prev = self.0.fetch_sub(SELF_REF_ONE, Ordering::AcqRel);
        debug_assert!(prev >= SELF_REF_ONE, "self reference underflow");
        prev == SELF_REF_ONE
    }

    pub(crate) fn children(&self) -> u64 {
        self.0.load(Ordering::Acquire) & CHILD_MASK
    }

    pub(crate) fn self_refs(&self) -> u64 {
        self.0.load(Ordering::Acquire) / SELF_REF_ONE
    }

    pub(crate) fn is_zero(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }
}
