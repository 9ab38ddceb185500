//! Job scheduling constants, backoff policy and state machine.
//!
//! This module lives in `core` (zero internal deps) so it can be used by the
//! repository layer, the in-memory store and the queue engine alike.

use std::time::Duration;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Priority constants
// ---------------------------------------------------------------------------

/// Priority value for normal jobs. Lower values are dispatched first.
pub const PRIORITY_NORMAL: i32 = 10;

// ---------------------------------------------------------------------------
// Retry / liveness defaults
// ---------------------------------------------------------------------------

/// Attempts a job gets before it is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Base delay of the retry backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Upper bound on a single retry delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// A running job without a heartbeat for this long is considered abandoned.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(600);

/// How often a worker refreshes the heartbeat of the job it owns.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Number of concurrent workers when not configured.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 5;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential retry backoff: `base * 2^(attempt - 1)`, clamped to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Result<Self, CoreError> {
        if base.is_zero() {
            return Err(CoreError::Config("Backoff base must be positive".to_string()));
        }
        if max < base {
            return Err(CoreError::Config(
                "Backoff cap must not be smaller than the base delay".to_string(),
            ));
        }
        Ok(Self { base, max })
    }

    /// Delay before a job whose `attempt`-th attempt just failed may run again.
    ///
    /// `attempt` is 1-based: the first failure waits `base`, the second
    /// `2 * base`, and so on.
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 31) as u32;
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Job status IDs matching `job_statuses` seed data (1-based SMALLSERIAL).
///
/// Duplicated from the `db` crate's `JobStatus` enum because `core` must
/// have zero internal deps.
pub mod state_machine {
    /// Returns the set of valid target status IDs reachable from `from_status`.
    ///
    /// Terminal states (Completed=3, Failed=4, DeadLettered=5) return an
    /// empty slice because no further transitions are allowed.
    pub fn valid_transitions(from_status: i16) -> &'static [i16] {
        match from_status {
            // Queued -> Running
            1 => &[2],
            // Running -> Queued (retry / stall), Completed, Failed, DeadLettered
            2 => &[1, 3, 4, 5],
            // Terminal states
            3..=5 => &[],
            _ => &[],
        }
    }

    /// Check whether a transition from `from` to `to` is valid.
    pub fn can_transition(from: i16, to: i16) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Validate a state transition, returning an error message for invalid ones.
    pub fn validate_transition(from: i16, to: i16) -> Result<(), String> {
        if can_transition(from, to) {
            Ok(())
        } else {
            let from_name = status_name(from);
            let to_name = status_name(to);
            Err(format!(
                "Invalid transition: {from_name} ({from}) -> {to_name} ({to})"
            ))
        }
    }

    /// Human-readable name for a status ID (for error messages).
    pub fn status_name(id: i16) -> &'static str {
        match id {
            1 => "Queued",
            2 => "Running",
            3 => "Completed",
            4 => "Failed",
            5 => "DeadLettered",
            _ => "Unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::state_machine::*;
    use super::*;

    // -----------------------------------------------------------------------
    // Backoff
    // -----------------------------------------------------------------------

    #[test]
    fn first_retry_waits_base_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_clamps_at_max() {
        let policy = BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(10)).unwrap();
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn zero_attempt_treated_as_first() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), policy.base);
    }

    #[test]
    fn zero_base_rejected() {
        assert!(BackoffPolicy::new(Duration::ZERO, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn cap_below_base_rejected() {
        assert!(BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(1)).is_err());
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    #[test]
    fn queued_to_running() {
        assert!(can_transition(1, 2));
    }

    #[test]
    fn running_back_to_queued() {
        assert!(can_transition(2, 1));
    }

    #[test]
    fn running_to_each_terminal_state() {
        assert!(can_transition(2, 3));
        assert!(can_transition(2, 4));
        assert!(can_transition(2, 5));
    }

    #[test]
    fn queued_cannot_complete_directly() {
        assert!(!can_transition(1, 3));
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        assert!(valid_transitions(3).is_empty());
        assert!(valid_transitions(4).is_empty());
        assert!(valid_transitions(5).is_empty());
    }

    #[test]
    fn dead_lettered_never_requeued() {
        assert!(!can_transition(5, 1));
    }

    #[test]
    fn validate_transition_err() {
        let err = validate_transition(3, 2).unwrap_err();
        assert!(err.contains("Completed"));
        assert!(err.contains("Running"));
    }

    #[test]
    fn unknown_status_has_no_transitions() {
        assert!(valid_transitions(99).is_empty());
    }
}
