#![doc = include_str!("../README.md")]

mod builder;
mod entry;
mod error;
mod heap;
mod queue;
mod timer;

pub use builder::TimeQueueBuilder;
pub use entry::{Entry, Priority};
pub use error::TimeQueueError;
pub use queue::{TimeQueue, DEFAULT_CAPACITY};
