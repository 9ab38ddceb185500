//! Durable, priority-ordered job queue over the generation provider.
//!
//! - [`JobQueue`]: enqueue, status, cancel, stall recovery and the
//!   claim-and-process step.
//! - [`JobQueue::run`]: fixed-size worker pool plus stall monitor
//!   (see [`dispatcher`]).

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod queue;
pub mod view;

#[cfg(test)]
mod test_support;

pub use config::QueueConfig;
pub use error::QueueError;
pub use queue::{JobQueue, ProcessOutcome, RETRIES_EXHAUSTED_CODE};
pub use view::JobView;
