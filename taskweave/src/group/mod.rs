//! Task groups, the submit-and-wait front door of an arena.

mod context;
pub use context::ContextKind;
pub(crate) use context::GroupContext;

mod handle;
pub use handle::TaskHandle;

mod task_group;
pub use task_group::TaskGroup;

/// Outcome of [`TaskGroup::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Every task ran to completion.
    Complete,

    /// The group was cancelled, some tasks may have been skipped.
    Cancelled,
}
