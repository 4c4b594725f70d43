use crate::builder::TimeQueueBuilder;
use crate::entry::{Entry, Priority};
use crate::error::TimeQueueError;
use crate::heap::IndexedHeap;
use crate::timer::{Wake, WakeTimer};
use flume::{Receiver, Selector, SendError, Sender, TryRecvError};
use static_assertions::assert_impl_all;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Sink capacity used by [`TimeQueue::new`].
pub const DEFAULT_CAPACITY: usize = 1;

/// Heap plus wake timer. Exactly one party owns it at any instant: the run
/// loop, a caller that paused the run loop, or the stopped queue itself.
/// Ownership moves by value over the control channels.
struct Core<T> {
    heap: IndexedHeap<T>,
    timer: WakeTimer,
}

impl<T> Core<T> {
    fn new() -> Self {
        Self {
            heap: IndexedHeap::new(),
            timer: WakeTimer::new(),
        }
    }

    /// Points the timer at the current head, or disarms it.
    fn rearm(&mut self) {
        match self.heap.peek() {
            Some(head) => self.timer.arm(head.at()),
            None => {
                self.timer.stop();
            }
        }
    }

    /// Adds `entries`, returning the ones the heap refused.
    fn push_all(&mut self, entries: Vec<Arc<Entry<T>>>) -> Vec<Arc<Entry<T>>> {
        let prev_head = self.heap.peek().map(Arc::as_ptr);
        let mut rejected = Vec::new();
        for entry in entries {
            if let Err(entry) = self.heap.push(entry) {
                rejected.push(entry);
            }
        }
        let head = self.heap.peek().map(|head| (Arc::as_ptr(head), head.at()));
        if let Some((ptr, at)) = head {
            if prev_head != Some(ptr) {
                // a displaced head still has its deadline armed
                if prev_head.is_some() {
                    self.timer.stop();
                }
                self.timer.arm(at);
            }
        }
        tracing::trace!(
            rejected = rejected.len(),
            pending = self.heap.len(),
            "pushed entries"
        );
        rejected
    }

    fn remove(&mut self, entry: &Entry<T>) -> bool {
        let was_head = self.heap.is_head(entry);
        if self.heap.remove(entry).is_none() {
            return false;
        }
        if was_head {
            self.timer.stop();
            self.rearm();
        }
        true
    }

    fn drain(&mut self) -> Vec<Arc<Entry<T>>> {
        if self.heap.is_empty() {
            return Vec::new();
        }
        self.timer.stop();
        self.heap.drain()
    }

    /// Releases the head if its instant has arrived, then re-arms.
    ///
    /// Blocks while the sink is full.
    fn release(&mut self, sink: &Sender<Arc<Entry<T>>>) {
        let due = self
            .heap
            .peek()
            .is_some_and(|head| head.at() <= Instant::now());
        if due {
            if let Some(entry) = self.heap.pop() {
                tracing::trace!(pending = self.heap.len(), "releasing entry");
                if let Err(SendError(entry)) = sink.send(entry) {
                    tracing::warn!(
                        late_by = ?entry.at().elapsed(),
                        "no receivers left, dropping released entry"
                    );
                }
            }
        }
        self.rearm();
    }
}

/// Requests the run loop reacts to in its wait.
enum Request {
    Pause,
    Stop,
}

/// Run loop's ends of the control channels.
struct LoopSide<T> {
    pause_rx: Receiver<()>,
    stop_rx: Receiver<()>,
    lease_tx: Sender<Core<T>>,
    return_rx: Receiver<Core<T>>,
    sink: Sender<Arc<Entry<T>>>,
}

/// Caller's handle on a running run loop.
struct RunLoop<T> {
    pause_tx: Sender<()>,
    stop_tx: Sender<()>,
    lease_rx: Receiver<Core<T>>,
    return_tx: Sender<Core<T>>,
    thread: JoinHandle<Option<Core<T>>>,
}

/// Core on loan from a paused run loop. The core goes back to the run loop
/// when the lease is dropped, including on unwind.
struct Lease<'a, T> {
    run: &'a RunLoop<T>,
    core: Core<T>,
    returned: bool,
}

impl<T> Lease<'_, T> {
    fn give_back(mut self) -> Result<(), Core<T>> {
        self.hand_back()
    }

    fn hand_back(&mut self) -> Result<(), Core<T>> {
        self.returned = true;
        let core = std::mem::replace(&mut self.core, Core::new());
        self.run.resume(core)
    }
}

impl<T> Drop for Lease<'_, T> {
    fn drop(&mut self) {
        if !self.returned && self.hand_back().is_err() {
            tracing::warn!("run loop gone while its core was on loan");
        }
    }
}

impl<T> RunLoop<T> {
    /// Asks the run loop to hand over the core and waits until it does.
    fn pause(&self) -> Option<Core<T>> {
        self.pause_tx.send(()).ok()?;
        self.lease_rx.recv().ok()
    }

    /// Gives the core back and lets the run loop continue.
    fn resume(&self, core: Core<T>) -> Result<(), Core<T>> {
        self.return_tx.send(core).map_err(|SendError(core)| core)
    }

    /// Stops the run loop and waits for the thread to exit, returning the
    /// core it owned. A panic on the run loop thread is resumed here.
    fn join(self) -> Option<Core<T>> {
        // fails only if the loop is already gone
        let _ = self.stop_tx.send(());
        match self.thread.join() {
            Ok(core) => core,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn run_loop<T>(ctl: LoopSide<T>) -> Option<Core<T>> {
    // the starting caller hands over the core once the thread exists
    let mut core = ctl.return_rx.recv().ok()?;
    tracing::debug!(
        pending = core.heap.len(),
        armed = core.timer.is_armed(),
        "run loop started"
    );
    loop {
        let selector = Selector::new()
            .recv(&ctl.pause_rx, |msg| match msg {
                Ok(()) => Request::Pause,
                Err(_) => Request::Stop,
            })
            .recv(&ctl.stop_rx, |_| Request::Stop);
        match core.timer.wait(selector) {
            Wake::Fired => core.release(&ctl.sink),
            Wake::Event(Request::Pause) => {
                if let Err(SendError(returned)) = ctl.lease_tx.send(core) {
                    core = returned;
                    break;
                }
                match ctl.return_rx.recv() {
                    Ok(returned) => core = returned,
                    Err(_) => {
                        tracing::error!("core was not returned after pause, run loop exiting");
                        return None;
                    }
                }
            }
            Wake::Event(Request::Stop) => break,
        }
        // don't let a stop request wait behind a fresh long wait
        match ctl.stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
    }
    tracing::debug!(
        pending = core.heap.len(),
        next = ?core.timer.deadline(),
        "run loop exited"
    );
    Some(core)
}

enum State<T> {
    Stopped(Core<T>),
    Running(RunLoop<T>),
    /// Left behind only if the run loop panicked during a transition.
    Poisoned,
}

/// A queue that releases entries on a channel when their instant arrives.
///
/// Entries are kept in a min-heap ordered by release instant, then priority,
/// then creation order. While running, a dedicated thread sleeps until the
/// earliest entry is due, pops it and sends it on the sink returned by
/// [`TimeQueue::sink`]. Every other operation is synchronous and safe to call
/// from any thread.
///
/// The run loop sends on the sink itself, so a full sink blocks the run loop
/// and, with it, every operation that needs the heap (`push`, `remove`,
/// `drain`, `size`, `peek`, `stop`) until a consumer receives. A caller
/// blocked that way holds the queue's lock, so `start` and `is_running` wait
/// behind it too. Consume the sink from a thread other than the producers, and
/// size it with [`TimeQueue::with_capacity`] accordingly.
///
/// Dropping a running queue signals its run loop to exit without waiting for
/// it.
pub struct TimeQueue<T> {
    // also the mutual exclusion between external callers
    state: Mutex<State<T>>,
    sink_tx: Sender<Arc<Entry<T>>>,
    sink_rx: Receiver<Arc<Entry<T>>>,
    capacity: usize,
    thread_name: String,
}
assert_impl_all!(TimeQueue<u64>: Send, Sync);
assert_impl_all!(Entry<u64>: Send, Sync);

impl<T> TimeQueue<T>
where
    T: Send + Sync + 'static,
{
    /// Creates a started queue with a sink of [`DEFAULT_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a started queue whose sink buffers `capacity` entries.
    ///
    /// If the run loop thread cannot be spawned the error is logged and the
    /// queue is returned stopped; use [`TimeQueue::builder`] to handle it.
    pub fn with_capacity(capacity: usize) -> Self {
        let queue = Self::from_builder(TimeQueueBuilder::new().capacity(capacity));
        queue.start();
        queue
    }

    pub fn builder() -> TimeQueueBuilder {
        TimeQueueBuilder::new()
    }

    /// Builds a stopped queue.
    pub(crate) fn from_builder(builder: TimeQueueBuilder) -> Self {
        let capacity = builder.capacity.max(1);
        let (sink_tx, sink_rx) = flume::bounded(capacity);
        Self {
            state: Mutex::new(State::Stopped(Core::new())),
            sink_tx,
            sink_rx,
            capacity,
            thread_name: builder.thread_name,
        }
    }

    /// Starts the run loop. Returns false if it was already running or the
    /// thread could not be spawned.
    pub fn start(&self) -> bool {
        match self.try_start() {
            Ok(started) => started,
            Err(err) => {
                tracing::error!(%err, "failed to start time queue");
                false
            }
        }
    }

    /// Starts the run loop. Returns `Ok(false)` if it was already running.
    /// On error the queue stays stopped with its entries intact.
    pub fn try_start(&self) -> Result<bool, TimeQueueError> {
        let mut state = self.lock();
        if matches!(*state, State::Running(_)) {
            return Ok(false);
        }
        let mut core = match std::mem::replace(&mut *state, State::Poisoned) {
            State::Stopped(core) => core,
            _ => Core::new(),
        };
        core.rearm();

        let (pause_tx, pause_rx) = flume::bounded(0);
        let (stop_tx, stop_rx) = flume::bounded(0);
        let (lease_tx, lease_rx) = flume::bounded(0);
        let (return_tx, return_rx) = flume::bounded(0);
        let side = LoopSide {
            pause_rx,
            stop_rx,
            lease_tx,
            return_rx,
            sink: self.sink_tx.clone(),
        };
        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run_loop(side));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                *state = State::Stopped(core);
                return Err(err.into());
            }
        };
        let run = RunLoop {
            pause_tx,
            stop_tx,
            lease_rx,
            return_tx,
            thread,
        };
        if let Err(core) = run.resume(core) {
            // thread died before taking the core
            let _ = run.join();
            *state = State::Stopped(core);
            return Ok(false);
        }
        *state = State::Running(run);
        tracing::debug!(thread = %self.thread_name, "time queue started");
        Ok(true)
    }

    /// Stops the run loop and waits for it to exit. Returns false if the
    /// queue was not running. Pending entries stay queued and are released
    /// after the next [`TimeQueue::start`].
    pub fn stop(&self) -> bool {
        let mut state = self.lock();
        if !matches!(*state, State::Running(_)) {
            return false;
        }
        let State::Running(run) = std::mem::replace(&mut *state, State::Poisoned) else {
            unreachable!("checked running above");
        };
        let mut core = run.join().unwrap_or_else(Core::new);
        let cancelled = core.timer.stop();
        tracing::debug!(pending = core.heap.len(), cancelled, "time queue stopped");
        *state = State::Stopped(core);
        true
    }

    /// Whether the run loop is running. Waits for the queue's lock, so it
    /// blocks while another caller is held up by a full sink.
    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), State::Running(_))
    }

    /// Schedules `payload` for release at `at` with priority 0. An instant
    /// in the past is released right away.
    pub fn push(&self, at: Instant, payload: T) -> Arc<Entry<T>> {
        self.push_with_priority(at, 0, payload)
    }

    /// Schedules `payload` for release at `at`; among entries due at the same
    /// instant, smaller priorities are released first.
    pub fn push_with_priority(
        &self,
        at: Instant,
        priority: Priority,
        payload: T,
    ) -> Arc<Entry<T>> {
        let entry = Entry::with_priority(at, priority, payload);
        // a fresh entry is never refused
        let _ = self.with_core(|core| core.push_all(vec![entry.clone()]));
        entry
    }

    /// Schedules pre-built entries in one critical section. Entries that are
    /// queued or were queued before are skipped. Returns how many were added.
    pub fn push_all<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = Arc<Entry<T>>>,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        if entries.is_empty() {
            return 0;
        }
        let total = entries.len();
        let rejected = self.with_core(|core| core.push_all(entries));
        let accepted = total - rejected.len();
        // payload destructors of refused entries run outside the lock
        drop(rejected);
        accepted
    }

    /// Removes a pending entry. Returns false if it is not in this queue,
    /// including when it was already released, removed or drained.
    pub fn remove(&self, entry: &Entry<T>) -> bool {
        self.with_core(|core| core.remove(entry))
    }

    /// Empties the queue: every pending entry plus every released entry still
    /// buffered in the sink. Pending entries come first, in no particular
    /// order.
    pub fn drain(&self) -> Vec<Arc<Entry<T>>> {
        self.with_core(|core| {
            let mut drained = core.drain();
            drained.extend(self.sink_rx.drain());
            tracing::debug!(drained = drained.len(), "time queue drained");
            drained
        })
    }

    /// Number of entries waiting for release. Entries buffered in the sink
    /// are not counted.
    pub fn size(&self) -> usize {
        self.with_core(|core| core.heap.len())
    }

    /// The entry that will be released next, if any.
    pub fn peek(&self) -> Option<Arc<Entry<T>>> {
        self.with_core(|core| core.heap.peek().cloned())
    }

    /// The channel released entries are sent on. Every call returns a handle
    /// to the same channel.
    pub fn sink(&self) -> Receiver<Arc<Entry<T>>> {
        self.sink_rx.clone()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with exclusive access to the core, pausing the run loop
    /// around it when running.
    fn with_core<R>(&self, f: impl FnOnce(&mut Core<T>) -> R) -> R {
        let mut state = self.lock();
        if let State::Poisoned = *state {
            tracing::error!("time queue lost its run loop, continuing with an empty queue");
            *state = State::Stopped(Core::new());
        }
        if let State::Stopped(core) = &mut *state {
            return f(core);
        }

        let leased = match &*state {
            State::Running(run) => run.pause(),
            _ => None,
        };
        let Some(core) = leased else {
            // run loop is gone; reap it and carry on stopped
            let mut core = Self::reap(&mut state);
            let out = f(&mut core);
            *state = State::Stopped(core);
            return out;
        };
        let State::Running(run) = &*state else {
            unreachable!("only a running queue leases its core");
        };
        let mut lease = Lease {
            run,
            core,
            returned: false,
        };
        let out = f(&mut lease.core);
        if let Err(core) = lease.give_back() {
            Self::reap(&mut state);
            *state = State::Stopped(core);
        }
        out
    }

    /// Joins a run loop that stopped cooperating, recovering its core if it
    /// still has one.
    fn reap(state: &mut State<T>) -> Core<T> {
        match std::mem::replace(state, State::Poisoned) {
            State::Running(run) => run.join().unwrap_or_else(Core::new),
            State::Stopped(core) => core,
            State::Poisoned => Core::new(),
        }
    }
}

impl<T> Default for TimeQueue<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::time::Duration;

    fn stopped<T: Send + Sync + 'static>(capacity: usize) -> TimeQueue<T> {
        TimeQueueBuilder::new()
            .capacity(capacity)
            .start(false)
            .build()
            .unwrap()
    }

    #[test]
    fn test_new_is_started() {
        let queue = TimeQueue::<u32>::new();
        assert!(queue.is_running());
        assert_eq!(queue.capacity(), DEFAULT_CAPACITY);
        assert_eq!(queue.size(), 0);
        assert!(queue.stop());
    }

    #[test]
    fn test_start_stop_idempotent() {
        let queue = stopped::<u32>(1);
        assert!(queue.start());
        assert!(!queue.start());
        assert!(queue.stop());
        assert!(!queue.stop());
        assert!(!queue.is_running());
    }

    #[test]
    fn test_timer_follows_head_on_push() {
        let queue = stopped::<u32>(1);
        let now = Instant::now();
        queue.push(now + Duration::from_secs(3), 3);
        queue.push(now + Duration::from_secs(1), 1);
        queue.push(now + Duration::from_secs(2), 2);

        let state = queue.lock();
        let State::Stopped(core) = &*state else {
            panic!("expected stopped");
        };
        assert_eq!(core.timer.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_timer_follows_head_on_remove() {
        let queue = stopped::<u32>(1);
        let now = Instant::now();
        let first = queue.push(now + Duration::from_secs(1), 1);
        let second = queue.push(now + Duration::from_secs(2), 2);

        assert!(queue.remove(&first));
        {
            let state = queue.lock();
            let State::Stopped(core) = &*state else {
                panic!("expected stopped");
            };
            assert_eq!(core.timer.deadline(), Some(second.at()));
        }
        assert!(queue.remove(&second));
        let state = queue.lock();
        let State::Stopped(core) = &*state else {
            panic!("expected stopped");
        };
        assert!(!core.timer.is_armed());
    }

    #[test]
    fn test_drain_disarms_timer() {
        let queue = stopped::<u32>(1);
        queue.push(Instant::now() + Duration::from_secs(60), 1);
        assert_eq!(queue.drain().len(), 1);
        let state = queue.lock();
        let State::Stopped(core) = &*state else {
            panic!("expected stopped");
        };
        assert!(!core.timer.is_armed());
    }

    #[test]
    fn test_stop_disarms_and_keeps_entries() {
        let queue = TimeQueue::<u32>::new();
        queue.push(Instant::now() + Duration::from_secs(60), 1);
        assert!(queue.stop());
        assert_eq!(queue.size(), 1);
        let state = queue.lock();
        let State::Stopped(core) = &*state else {
            panic!("expected stopped");
        };
        assert!(!core.timer.is_armed());
    }

    #[test]
    fn test_push_all_skips_used_entries() {
        let queue = stopped::<u32>(1);
        let now = Instant::now();
        let fresh = Entry::new(now, 1);
        let queued = queue.push(now, 2);
        let removed = queue.push(now, 3);
        assert!(queue.remove(&removed));

        assert_eq!(queue.push_all(vec![fresh.clone(), queued, removed]), 1);
        assert_eq!(queue.size(), 2);
        assert!(fresh.is_queued());
        assert_eq!(queue.push_all(Vec::new()), 0);
    }

    #[test]
    fn test_remove_foreign_entry() {
        let a = stopped::<u32>(1);
        let b = stopped::<u32>(1);
        let now = Instant::now();
        let entry = b.push(now, 1);
        a.push(now, 2);

        assert!(!a.remove(&entry));
        assert_eq!(a.size(), 1);
        assert_eq!(b.size(), 1);
        assert!(entry.is_queued());
    }

    #[test]
    fn test_peek_while_running() {
        let queue = TimeQueue::<u32>::new();
        assert!(queue.peek().is_none());
        let now = Instant::now();
        queue.push(now + Duration::from_secs(60), 2);
        let head = queue.push(now + Duration::from_secs(30), 1);
        assert!(Arc::ptr_eq(&queue.peek().unwrap(), &head));
        assert!(queue.stop());
    }

    #[test]
    fn test_release_while_running() {
        let queue = TimeQueue::new();
        let sink = queue.sink();
        let entry = queue.push(Instant::now(), "now");
        let released = sink.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(Arc::ptr_eq(&released, &entry));
        assert!(!released.is_queued());
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_drop_running_queue_with_full_sink() {
        let queue = stopped(1);
        let now = Instant::now();
        for i in 0..4 {
            queue.push(now, i);
        }
        let later = queue.push(now + Duration::from_secs(3600), 4);
        assert!(queue.start());

        // the run loop fills the sink and blocks on the next send
        let deadline = Instant::now() + Duration::from_secs(5);
        while !queue.sink_rx.is_full() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(queue.sink_rx.is_full());
        drop(queue);

        // with no receivers left the blocked send fails and the loop exits
        while later.is_queued() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!later.is_queued());
    }

    struct PanicOnDrop;

    impl Drop for PanicOnDrop {
        fn drop(&mut self) {
            panic!("payload dropped");
        }
    }

    #[test]
    fn test_refused_entry_dropped_outside_lock() {
        let queue = TimeQueue::new();
        let entry = queue.push(Instant::now() + Duration::from_secs(3600), PanicOnDrop);
        assert!(queue.remove(&entry));

        // the queue's handle is gone, so this is the last one
        let pushed = catch_unwind(AssertUnwindSafe(|| queue.push_all(vec![entry])));
        assert!(pushed.is_err());

        assert!(queue.is_running());
        assert_eq!(queue.size(), 0);
        assert!(queue.stop());
    }

    #[test]
    fn test_panic_while_paused_returns_core() {
        let queue = TimeQueue::new();
        let sink = queue.sink();
        queue.push(Instant::now() + Duration::from_secs(3600), 1);

        let result = catch_unwind(AssertUnwindSafe(|| {
            queue.with_core(|_| panic!("caller panicked with the core"))
        }));
        assert!(result.is_err());

        // the run loop got its core back and keeps releasing
        assert!(queue.is_running());
        assert_eq!(queue.size(), 1);
        queue.push(Instant::now(), 2);
        let released = sink.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*released.payload(), 2);
        assert!(queue.stop());
        assert_eq!(queue.size(), 1);
    }
}
