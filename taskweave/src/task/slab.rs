use crate::error::{Error, Result};
use crate::task::id::next_generation;
use crate::task::{Allocation, TaskCell, TaskRef};
use parking_lot::RwLock;
use slab::Slab;
use std::num::NonZeroU32;
use std::sync::Arc;

struct Entry {
    generation: NonZeroU32,
    cell: Arc<TaskCell>,
}

/// Bounded, generational storage of every live task of an arena.
pub(crate) struct TaskSlab {
    entries: RwLock<Slab<Entry>>,
    capacity: usize,
}

impl TaskSlab {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            // Start small, `max_tasks` is an upper bound not an expected size.
            entries: RwLock::new(Slab::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Stores the cell and returns its handle. Fails without side effects when
    /// the slab is at capacity.
    pub(crate) fn insert(&self, cell: TaskCell) -> Result<TaskRef> {
        let mut entries = self.entries.write();

        if entries.len() >= self.capacity {
            return Err(Error::Exhausted {
                capacity: self.capacity,
            });
        }

        let generation = next_generation();
        let index = entries.insert(Entry {
            generation,
            cell: Arc::new(cell),
        });

        // Capacity is validated against `u32::MAX` when the arena is built.
        let index = u32::try_from(index).map_err(|_| Error::Exhausted {
            capacity: self.capacity,
        })?;

        Ok(TaskRef::new(index, generation))
    }

    /// Resolves a handle. Returns `None` if the slot was freed, even if it was
    /// reused by another task since.
    pub(crate) fn get(&self, task: TaskRef) -> Option<Arc<TaskCell>> {
        self.entries
            .read()
            .get(task.index())
            .filter(|entry| entry.generation == task.generation())
            .map(|entry| Arc::clone(&entry.cell))
    }

    pub(crate) fn remove(&self, task: TaskRef) -> Option<Arc<TaskCell>> {
        let mut entries = self.entries.write();

        match entries.get(task.index()) {
            Some(entry) if entry.generation == task.generation() => {
                Some(entries.remove(task.index()).cell)
            }
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Number of tasks the scheduler is responsible for freeing.
    pub(crate) fn heap_len(&self) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.cell.allocation == Allocation::Heap)
            .count()
    }
}

impl std::fmt::Debug for TaskSlab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSlab")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{ContextKind, GroupContext};
    use crate::task::from_fn;
    use anyhow::Result;
    use static_assertions::assert_impl_all;

    assert_impl_all!(TaskSlab: Send, Sync);

    fn heap_cell() -> TaskCell {
        TaskCell::new_heap(
            Box::new(from_fn(|_| None)),
            None,
            GroupContext::new(ContextKind::Isolated),
        )
    }

    #[test]
    fn test_stale_handle_never_aliases() -> Result<()> {
        let slab = TaskSlab::new(4);

        let first = slab.insert(heap_cell())?;
        assert!(slab.remove(first).is_some());

        // Same slot, different generation.
        let second = slab.insert(heap_cell())?;
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);

        assert!(slab.get(first).is_none());
        assert!(slab.remove(first).is_none());
        assert!(slab.get(second).is_some());
        Ok(())
    }

    #[test]
    fn test_exhausted_at_capacity() -> Result<()> {
        let slab = TaskSlab::new(2);
        let a = slab.insert(heap_cell())?;
        let _b = slab.insert(heap_cell())?;

        assert!(matches!(
            slab.insert(heap_cell()),
            Err(Error::Exhausted { capacity: 2 })
        ));
        assert_eq!(slab.len(), 2);

        slab.remove(a);
        assert!(slab.insert(heap_cell()).is_ok());
        Ok(())
    }

    #[test]
    fn test_heap_len_ignores_stack_cells() -> Result<()> {
        let slab = TaskSlab::new(8);
        let group = GroupContext::new(ContextKind::Isolated);

        slab.insert(heap_cell())?;
        slab.insert(TaskCell::new_root(group))?;

        assert_eq!(slab.len(), 2);
        assert_eq!(slab.heap_len(), 1);
        Ok(())
    }
}
