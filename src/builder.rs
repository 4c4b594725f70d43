use crate::error::TimeQueueError;
use crate::queue::{TimeQueue, DEFAULT_CAPACITY};

/// Configures a [`TimeQueue`] before construction.
///
/// ```
/// use timequeue::TimeQueue;
///
/// let queue = TimeQueue::<String>::builder()
///     .capacity(16)
///     .thread_name("retry-timer")
///     .build::<String>()
///     .unwrap();
/// assert!(queue.is_running());
/// assert_eq!(queue.capacity(), 16);
/// ```
#[derive(Debug, Clone)]
pub struct TimeQueueBuilder {
    pub(crate) capacity: usize,
    pub(crate) thread_name: String,
    pub(crate) start: bool,
}

impl Default for TimeQueueBuilder {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            thread_name: "timequeue".to_string(),
            start: true,
        }
    }
}

impl TimeQueueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of released entries the sink buffers before the run loop
    /// blocks. Zero is treated as one.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Name given to the run loop thread.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Whether `build` starts the run loop (default true). A queue built
    /// stopped accepts pushes and releases nothing until started.
    pub fn start(mut self, start: bool) -> Self {
        self.start = start;
        self
    }

    pub fn build<T>(self) -> Result<TimeQueue<T>, TimeQueueError>
    where
        T: Send + Sync + 'static,
    {
        let start = self.start;
        let queue = TimeQueue::from_builder(self);
        if start {
            queue.try_start()?;
        }
        Ok(queue)
    }
}
