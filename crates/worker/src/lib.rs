//! Composition layer for the generation broker.
//!
//! - [`admission`]: submit/status facade over the economy and the queue.
//! - [`scheduler`]: daily pool, allocation and rotation driver.
//! - [`config`]: environment-driven configuration for the binary.

pub mod admission;
pub mod config;
pub mod scheduler;

#[cfg(test)]
mod test_support;

pub use admission::{Admission, AdmissionError, AdmissionOutcome, PriorityPolicy, TOKENS_PER_JOB};
pub use config::{ConfigError, LogFormat, WorkerConfig};
pub use scheduler::DailyScheduler;
