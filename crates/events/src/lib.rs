//! Job transition events.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`JobEvent`]: one job state transition.
//! - [`TransitionLogger`]: background subscriber that logs every transition.

pub mod bus;
pub mod logger;

pub use bus::{EventBus, JobEvent, JobEventKind};
pub use logger::TransitionLogger;
