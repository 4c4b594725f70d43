/// Error returned by the fallible constructors and [`TimeQueue::try_start`].
///
/// [`TimeQueue::try_start`]: crate::TimeQueue::try_start
#[derive(Debug, thiserror::Error)]
pub enum TimeQueueError {
    #[error("failed to spawn run loop thread: {0}")]
    Spawn(#[from] std::io::Error),
}
