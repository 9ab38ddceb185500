//! Structured logging of job transitions.
//!
//! [`TransitionLogger`] subscribes to the [`EventBus`](crate::bus::EventBus)
//! and writes one `tracing` event per [`JobEvent`]. It runs as a long-lived
//! background task and exits when the bus is dropped.

use tokio::sync::broadcast;

use crate::bus::{JobEvent, JobEventKind};

/// Background service that logs every job transition.
pub struct TransitionLogger;

impl TransitionLogger {
    /// Run the logging loop until the channel closes.
    pub async fn run(mut receiver: broadcast::Receiver<JobEvent>) {
        loop {
            match receiver.recv().await {
                Ok(event) => Self::log(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Transition logger lagged, some transitions were not logged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, transition logger shutting down");
                    break;
                }
            }
        }
    }

    fn log(event: &JobEvent) {
        let from = event.from.map(|s| s.as_str()).unwrap_or("-");
        let to = event.to.map(|s| s.as_str()).unwrap_or("-");
        match event.kind {
            JobEventKind::Failed | JobEventKind::DeadLettered => tracing::warn!(
                job_id = event.job_id,
                event_type = event.kind.event_type(),
                from,
                to,
                attempt = event.attempt,
                error = event.error.as_deref().unwrap_or(""),
                "Job reached terminal failure",
            ),
            JobEventKind::RetryScheduled | JobEventKind::Recovered => tracing::info!(
                job_id = event.job_id,
                event_type = event.kind.event_type(),
                from,
                to,
                attempt = event.attempt,
                error = event.error.as_deref().unwrap_or(""),
                "Job returned to queue",
            ),
            _ => tracing::debug!(
                job_id = event.job_id,
                event_type = event.kind.event_type(),
                from,
                to,
                attempt = event.attempt,
                "Job transition",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chorus_db::models::status::JobStatus;

    use super::*;
    use crate::bus::EventBus;

    #[tokio::test]
    async fn exits_when_bus_dropped() {
        let bus = EventBus::default();
        let handle = tokio::spawn(TransitionLogger::run(bus.subscribe()));

        bus.publish(
            JobEvent::new(JobEventKind::Failed, 9)
                .from_status(JobStatus::Running)
                .to_status(JobStatus::Failed)
                .with_error("rejected"),
        );
        drop(bus);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("logger should stop once the bus is gone")
            .unwrap();
    }
}
