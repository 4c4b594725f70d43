use crate::entry::{Entry, RETIRED};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

/// Binary min-heap of entries that keeps every entry's array position up to
/// date, so an entry can be located and removed in O(log n) from its handle.
///
/// Each heap has a process-unique id which attached entries record; that id
/// is the back-reference checked by [`IndexedHeap::remove`].
///
/// Not synchronized: the owner is responsible for exclusive access.
pub(crate) struct IndexedHeap<T> {
    id: u64,
    entries: Vec<Arc<Entry<T>>>,
}

impl<T> IndexedHeap<T> {
    pub fn new() -> Self {
        let id = NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed);
        debug_assert_ne!(id, RETIRED);
        Self {
            id,
            entries: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts a fresh entry. An entry that is already attached somewhere or
    /// was attached before is handed back, leaving the heap untouched.
    pub fn push(&mut self, entry: Arc<Entry<T>>) -> Result<(), Arc<Entry<T>>> {
        let pos = self.entries.len();
        if !entry.attach(self.id, pos) {
            return Err(entry);
        }
        self.entries.push(entry);
        self.sift_up(pos);
        Ok(())
    }

    /// Removes and detaches the earliest entry.
    pub fn pop(&mut self) -> Option<Arc<Entry<T>>> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.remove_at(0))
    }

    pub fn peek(&self) -> Option<&Arc<Entry<T>>> {
        self.entries.first()
    }

    /// Returns true if `entry` is stored in this heap.
    pub fn contains(&self, entry: &Entry<T>) -> bool {
        if entry.heap_id() != self.id {
            return false;
        }
        self.entries
            .get(entry.index())
            .is_some_and(|stored| std::ptr::eq(&**stored, entry))
    }

    pub fn is_head(&self, entry: &Entry<T>) -> bool {
        self.contains(entry) && entry.index() == 0
    }

    /// Removes `entry` from anywhere in the heap. Returns `None` without
    /// touching the heap if the entry is not a member.
    pub fn remove(&mut self, entry: &Entry<T>) -> Option<Arc<Entry<T>>> {
        if !self.contains(entry) {
            return None;
        }
        Some(self.remove_at(entry.index()))
    }

    /// Detaches every entry and returns them in heap (not sorted) order.
    pub fn drain(&mut self) -> Vec<Arc<Entry<T>>> {
        let entries = std::mem::take(&mut self.entries);
        for entry in entries.iter() {
            entry.detach();
        }
        entries
    }

    fn remove_at(&mut self, pos: usize) -> Arc<Entry<T>> {
        let last = self.entries.len() - 1;
        if pos != last {
            self.swap(pos, last);
        }
        // pos < len, so there is something to pop
        let removed = match self.entries.pop() {
            Some(entry) => entry,
            None => unreachable!("remove_at on empty heap"),
        };
        removed.detach();
        if pos < self.entries.len() {
            // the moved element may belong above or below its new slot
            if !self.sift_up(pos) {
                self.sift_down(pos);
            }
        }
        removed
    }

    #[inline]
    fn less(&self, i: usize, j: usize) -> bool {
        self.entries[i].precedes(&self.entries[j])
    }

    #[inline]
    fn swap(&mut self, i: usize, j: usize) {
        self.entries.swap(i, j);
        self.entries[i].set_index(i);
        self.entries[j].set_index(j);
    }

    /// Returns true if the element moved.
    fn sift_up(&mut self, mut pos: usize) -> bool {
        let start = pos;
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(pos, parent) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos != start
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, pos) {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
    }
}

impl<T> Drop for IndexedHeap<T> {
    fn drop(&mut self) {
        // entries may outlive the heap through caller handles
        for entry in self.entries.iter() {
            entry.detach();
        }
    }
}
