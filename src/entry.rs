use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Secondary ordering key. Among entries released at the same instant the
/// smaller priority is released first.
pub type Priority = i64;

/// Heap id of an entry that has never been pushed.
pub(crate) const NO_HEAP: u64 = 0;
/// Heap id of an entry that was pushed once and has since left its heap.
pub(crate) const RETIRED: u64 = u64::MAX;
/// Position of an entry that is not stored in any heap.
pub(crate) const DETACHED: usize = usize::MAX;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// A payload scheduled for release at a point in time.
///
/// Entries are handed around as `Arc<Entry<T>>`: the queue keeps one handle
/// while the entry is pending and passes that same handle to the sink on
/// release, while the caller may keep another to `remove` the entry later.
///
/// An entry is attached to at most one heap, at most once. After it leaves
/// (released, removed or drained) it is an inert value that can still be
/// read but never pushed again; create a new entry to reschedule a payload.
pub struct Entry<T> {
    at: Instant,
    priority: Priority,
    // creation order, last tie-break so exact ties come out FIFO
    seq: u64,
    payload: T,
    heap: AtomicU64,
    index: AtomicUsize,
}

impl<T> Entry<T> {
    /// Creates a detached entry with the default priority of 0.
    pub fn new(at: Instant, payload: T) -> Arc<Self> {
        Self::with_priority(at, 0, payload)
    }

    /// Creates a detached entry.
    pub fn with_priority(at: Instant, priority: Priority, payload: T) -> Arc<Self> {
        Arc::new(Self {
            at,
            priority,
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            payload,
            heap: AtomicU64::new(NO_HEAP),
            index: AtomicUsize::new(DETACHED),
        })
    }

    /// The instant at which the entry is released.
    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Takes the payload out if this is the only handle left.
    pub fn try_into_payload(self: Arc<Self>) -> Result<T, Arc<Self>> {
        Arc::try_unwrap(self).map(|entry| entry.payload)
    }

    /// Returns true while the entry is stored in a heap, i.e. it has been
    /// pushed and not yet released, removed or drained.
    pub fn is_queued(&self) -> bool {
        let heap = self.heap.load(Ordering::Acquire);
        heap != NO_HEAP && heap != RETIRED
    }

    /// Strict ordering used by the heap: earlier instant, then smaller
    /// priority, then earlier creation.
    #[inline]
    pub(crate) fn precedes(&self, other: &Self) -> bool {
        (self.at, self.priority, self.seq) < (other.at, other.priority, other.seq)
    }

    #[inline]
    pub(crate) fn heap_id(&self) -> u64 {
        self.heap.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::Relaxed);
    }

    /// Claims the entry for `heap`. Fails if it was ever attached before.
    pub(crate) fn attach(&self, heap: u64, index: usize) -> bool {
        if self
            .heap
            .compare_exchange(NO_HEAP, heap, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.set_index(index);
        true
    }

    pub(crate) fn detach(&self) {
        self.index.store(DETACHED, Ordering::Relaxed);
        self.heap.store(RETIRED, Ordering::Release);
    }
}

impl<T: fmt::Debug> fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("at", &self.at)
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .field("payload", &self.payload)
            .field("queued", &self.is_queued())
            .finish()
    }
}

impl<T: fmt::Display> fmt::Display for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let now = Instant::now();
        if self.at > now {
            write!(f, "{} in {:?}", self.payload, self.at - now)?;
        } else {
            write!(f, "{} due {:?} ago", self.payload, now - self.at)?;
        }
        if self.priority != 0 {
            write!(f, " (priority {})", self.priority)?;
        }
        Ok(())
    }
}
