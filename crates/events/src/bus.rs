//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] fans out every [`JobEvent`] the queue engine publishes. It is
//! shared via `Arc<EventBus>`; publishing never blocks and never fails.

use chorus_core::types::{JobId, Timestamp};
use chorus_db::models::status::JobStatus;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// What happened to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Enqueued,
    Claimed,
    Completed,
    RetryScheduled,
    Failed,
    DeadLettered,
    Cancelled,
    /// Returned to the queue (or dead-lettered) by the stall monitor.
    Recovered,
}

impl JobEventKind {
    /// Dot-separated event name, e.g. `"job.retry_scheduled"`.
    pub fn event_type(self) -> &'static str {
        match self {
            JobEventKind::Enqueued => "job.enqueued",
            JobEventKind::Claimed => "job.claimed",
            JobEventKind::Completed => "job.completed",
            JobEventKind::RetryScheduled => "job.retry_scheduled",
            JobEventKind::Failed => "job.failed",
            JobEventKind::DeadLettered => "job.dead_lettered",
            JobEventKind::Cancelled => "job.cancelled",
            JobEventKind::Recovered => "job.recovered",
        }
    }
}

/// A job state transition.
///
/// Constructed via [`JobEvent::new`] and enriched with the builder methods
/// [`from_status`](JobEvent::from_status), [`to_status`](JobEvent::to_status),
/// [`with_attempt`](JobEvent::with_attempt) and
/// [`with_error`](JobEvent::with_error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job_id: JobId,
    /// `None` for `Enqueued`.
    pub from: Option<JobStatus>,
    /// `None` for `Cancelled`, where the row is removed.
    pub to: Option<JobStatus>,
    /// Attempt number the transition belongs to (0 before the first claim).
    pub attempt: i32,
    pub error: Option<String>,
    pub timestamp: Timestamp,
}

impl JobEvent {
    pub fn new(kind: JobEventKind, job_id: JobId) -> Self {
        Self {
            kind,
            job_id,
            from: None,
            to: None,
            attempt: 0,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn from_status(mut self, status: JobStatus) -> Self {
        self.from = Some(status);
        self
    }

    pub fn to_status(mut self, status: JobStatus) -> Self {
        self.to = Some(status);
        self
    }

    pub fn with_attempt(mut self, attempt: i32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Override the timestamp, for callers driven by an injected clock.
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// ```rust
/// use chorus_events::bus::{EventBus, JobEvent, JobEventKind};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(JobEvent::new(JobEventKind::Enqueued, 1));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full the oldest un-consumed events are dropped and
    /// slow receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: JobEvent) {
        // A SendError only means there are no receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_transition() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(
            JobEvent::new(JobEventKind::RetryScheduled, 42)
                .from_status(JobStatus::Running)
                .to_status(JobStatus::Queued)
                .with_attempt(2)
                .with_error("provider timeout"),
        );

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.job_id, 42);
        assert_eq!(e1.from, Some(JobStatus::Running));
        assert_eq!(e1.to, Some(JobStatus::Queued));
        assert_eq!(e1.attempt, 2);
        assert_eq!(e1.error.as_deref(), Some("provider timeout"));
        assert_eq!(e2.kind, JobEventKind::RetryScheduled);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(JobEvent::new(JobEventKind::Enqueued, 1));
    }

    #[test]
    fn event_types_are_namespaced() {
        assert_eq!(JobEventKind::DeadLettered.event_type(), "job.dead_lettered");
        let json = serde_json::to_value(JobEvent::new(JobEventKind::Cancelled, 3)).unwrap();
        assert_eq!(json["kind"], "cancelled");
        assert!(json["to"].is_null());
    }
}
