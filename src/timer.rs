use flume::Selector;
use std::time::Instant;

/// Outcome of waiting on a [`WakeTimer`] together with other event sources.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Wake<R> {
    /// The armed deadline passed before any other source was ready.
    Fired,
    /// One of the other sources was selected.
    Event(R),
}

/// One-shot timer over a single reusable deadline.
///
/// The timer never owns a thread: its fire event is the deadline of a
/// [`Selector`] wait, so arming and stopping are plain field updates and a
/// stopped timer cannot deliver a stale signal into a later wait.
#[derive(Debug, Default)]
pub(crate) struct WakeTimer {
    deadline: Option<Instant>,
}

impl WakeTimer {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Arms the timer to fire at `at`, replacing any earlier arming.
    pub fn arm(&mut self, at: Instant) {
        if let Some(prev) = self.deadline.replace(at) {
            tracing::trace!(?prev, ?at, "wake timer re-armed");
        }
    }

    /// Disarms the timer. Returns true if it was armed, including when the
    /// deadline already passed but nobody consumed the firing yet.
    pub fn stop(&mut self) -> bool {
        match self.deadline.take() {
            Some(deadline) => {
                if deadline <= Instant::now() {
                    tracing::trace!(?deadline, "discarding unconsumed wake");
                }
                true
            }
            None => false,
        }
    }

    /// Blocks until the timer fires or one of the selector's sources is
    /// ready. A disarmed timer never fires.
    ///
    /// A firing is consumed: the timer is disarmed before `Fired` is
    /// returned.
    pub fn wait<R>(&mut self, selector: Selector<'_, R>) -> Wake<R> {
        match self.deadline {
            Some(deadline) => match selector.wait_deadline(deadline) {
                Ok(event) => Wake::Event(event),
                Err(_) => {
                    self.deadline = None;
                    Wake::Fired
                }
            },
            None => Wake::Event(selector.wait()),
        }
    }
}
