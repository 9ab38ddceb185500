//! Queue engine tuning.

use std::time::Duration;

use chorus_core::error::CoreError;
use chorus_core::scheduling::{
    BackoffPolicy, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_ATTEMPTS, DEFAULT_STALL_TIMEOUT,
    DEFAULT_WORKER_CONCURRENCY,
};

/// How long an idle worker sleeps before polling again when no enqueue
/// notification arrives.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How often the stall monitor scans for silent running jobs.
pub const DEFAULT_STALL_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Provider calls never get less than this, whatever the estimate says.
pub const DEFAULT_PROVIDER_TIMEOUT_FLOOR: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Attempts given to jobs enqueued without an explicit limit.
    pub max_attempts: i32,
    pub backoff: BackoffPolicy,
    /// A running job whose heartbeat is older than this is recovered.
    pub stall_timeout: Duration,
    pub stall_check_interval: Duration,
    pub heartbeat_interval: Duration,
    pub provider_timeout_floor: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            stall_check_interval: DEFAULT_STALL_CHECK_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            provider_timeout_floor: DEFAULT_PROVIDER_TIMEOUT_FLOOR,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.concurrency == 0 {
            return Err(CoreError::Config("Worker concurrency must be at least 1".to_string()));
        }
        if self.max_attempts < 1 {
            return Err(CoreError::Config("Max attempts must be at least 1".to_string()));
        }
        for (name, value) in [
            ("poll interval", self.poll_interval),
            ("heartbeat interval", self.heartbeat_interval),
            ("stall check interval", self.stall_check_interval),
        ] {
            if value.is_zero() {
                return Err(CoreError::Config(format!("The {name} must be positive")));
            }
        }
        // A healthy worker must get several heartbeats in before it looks stalled.
        if self.stall_timeout <= self.heartbeat_interval * 2 {
            return Err(CoreError::Config(
                "Stall timeout must exceed twice the heartbeat interval".to_string(),
            ));
        }
        Ok(())
    }
}
