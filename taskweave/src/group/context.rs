use crate::error::TaskPanic;
use dashmap::DashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use tracing::trace;

/// How a task group's cancellation context relates to the context of the
/// code that creates it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Attached to the context of the task creating the group (if any), and
    /// cancelled along with it.
    #[default]
    Bound,

    /// Independent of any other context.
    Isolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Cancellation state shared by every task of a group.
///
/// Contexts form a tree: cancelling a context cancels all of its bound
/// descendants. Links go through `Weak` in both directions, a context is
/// owned by its group and by the tasks running under it.
pub(crate) struct GroupContext {
    pub(crate) id: ContextId,

    kind: ContextKind,

    cancelled: AtomicBool,

    /// First panic captured in the group. Later ones are dropped.
    panic: Mutex<Option<TaskPanic>>,

    // Lazily initialized because most groups never get nested groups.
    children: LazyLock<DashMap<ContextId, Weak<GroupContext>>>,

    // Lets us check for children in O(1) without initializing the map.
    child_count: AtomicUsize,

    parent: Mutex<Option<Weak<GroupContext>>>,
}

impl GroupContext {
    pub(crate) fn new(kind: ContextKind) -> Arc<Self> {
        Arc::new(Self {
            id: ContextId::next(),
            kind,
            cancelled: AtomicBool::new(false),
            panic: Mutex::new(None),
            // Tune-down the number of shards on the dashmap because default is
            // `shards == num_cores * 4`.
            children: LazyLock::new(|| DashMap::with_shard_amount(4)),
            child_count: AtomicUsize::new(0),
            parent: Mutex::new(None),
        })
    }

    /// Creates a context bound to `parent`. It starts cancelled if the parent
    /// already is.
    pub(crate) fn new_bound(parent: &Arc<GroupContext>) -> Arc<Self> {
        let child = Self::new(ContextKind::Bound);
        *child.parent.lock() = Some(Arc::downgrade(parent));
        parent.add_child(child.id, Arc::downgrade(&child));

        // Checked after registration so a concurrent `cancel` on the parent
        // either sees the child or is seen here.
        if parent.is_cancelled() {
            child.cancel();
        }

        child
    }

    pub(crate) fn kind(&self) -> ContextKind {
        self.kind
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancels this context and its descendants. Returns false if it was
    /// already cancelled.
    pub(crate) fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }

        trace!(id = ?self.id, "context cancelled");

        for child in self.live_children() {
            child.cancel();
        }

        true
    }

    /// Stores the panic if it is the first one, and cancels the context.
    pub(crate) fn register_panic(&self, panic: TaskPanic) {
        {
            let mut slot = self.panic.lock();
            if slot.is_none() {
                *slot = Some(panic);
            }
        }

        self.cancel();
    }

    pub(crate) fn take_panic(&self) -> Option<TaskPanic> {
        self.panic.lock().take()
    }

    /// Makes the context reusable after a wait. Descendants are left alone.
    pub(crate) fn reset(&self) {
        self.panic.lock().take();
        self.cancelled.store(false, Ordering::Release);
    }

    pub(crate) fn num_children(&self) -> usize {
        self.child_count.load(Ordering::Relaxed)
    }

    fn add_child(&self, id: ContextId, child: Weak<GroupContext>) {
        self.child_count.fetch_add(1, Ordering::Relaxed);
        let old = self.children.insert(id, child);
        debug_assert!(old.is_none());
    }

    fn remove_child(&self, id: &ContextId) {
        if self.children.remove(id).is_some() {
            self.child_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn live_children(&self) -> SmallVec<[Arc<GroupContext>; 4]> {
        // Don't initialize the map just to find out it is empty.
        if self.num_children() == 0 {
            return SmallVec::new();
        }

        self.children
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    fn parent(&self) -> Option<Arc<GroupContext>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl Drop for GroupContext {
    fn drop(&mut self) {
        if let Some(parent) = self.parent() {
            parent.remove_child(&self.id);
        }
    }
}

impl fmt::Debug for GroupContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("cancelled", &self.is_cancelled())
            .field("num_children", &self.num_children())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(GroupContext: Send, Sync);

    #[test]
    fn test_cancel_propagates_to_bound_descendants() {
        let root = GroupContext::new(ContextKind::Isolated);
        let child = GroupContext::new_bound(&root);
        let grandchild = GroupContext::new_bound(&child);
        let other = GroupContext::new(ContextKind::Isolated);

        assert!(root.cancel());
        assert!(!root.cancel());

        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_cancel_does_not_propagate_up() {
        let root = GroupContext::new(ContextKind::Isolated);
        let child = GroupContext::new_bound(&root);

        child.cancel();
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_bound_to_cancelled_parent_starts_cancelled() {
        let root = GroupContext::new(ContextKind::Isolated);
        root.cancel();

        let child = GroupContext::new_bound(&root);
        assert!(child.is_cancelled());
        assert_eq!(child.kind(), ContextKind::Bound);
    }

    #[test]
    fn test_first_panic_wins() {
        let ctx = GroupContext::new(ContextKind::Isolated);
        ctx.register_panic(TaskPanic::new(Box::new("first")));
        ctx.register_panic(TaskPanic::new(Box::new("second")));

        assert!(ctx.is_cancelled());
        assert_eq!(ctx.take_panic().map(|p| p.message().to_string()), Some("first".into()));
        assert!(ctx.take_panic().is_none());

        ctx.reset();
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_dropped_child_unregisters() {
        let root = GroupContext::new(ContextKind::Isolated);
        assert_eq!(root.num_children(), 0);

        let child = GroupContext::new_bound(&root);
        assert_eq!(root.num_children(), 1);

        drop(child);
        assert_eq!(root.num_children(), 0);
    }
}
