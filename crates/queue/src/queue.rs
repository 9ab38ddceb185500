//! The job queue engine.
//!
//! [`JobQueue`] owns the job lifecycle: enqueue, claim, provider call,
//! outcome recording, cancellation and stall recovery. Durable state lives
//! in the [`JobStore`]; every write after a claim is fenced on the claim
//! token, so a worker that lost its job (stall recovery) cannot overwrite
//! the new owner's state.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use chorus_core::clock::Clock;
use chorus_core::generation::provider_timeout;
use chorus_core::scheduling::state_machine;
use chorus_core::types::{JobId, Timestamp};
use chorus_db::models::job::{Job, JobFailure, NewJob, StatusCount};
use chorus_db::models::status::JobStatus;
use chorus_db::JobStore;
use chorus_events::{EventBus, JobEvent, JobEventKind};
use chorus_provider::{GenerationOutput, GenerationProvider, ProviderError};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::view::JobView;

/// Error code stored on jobs that ran out of attempts.
pub const RETRIES_EXHAUSTED_CODE: &str = "retries_exhausted";

/// What one claim-and-process step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed(JobId),
    RetryScheduled { job_id: JobId, available_at: Timestamp },
    Failed(JobId),
    DeadLettered(JobId),
    /// The claim was lost before the outcome could be written (the job was
    /// recovered by the stall monitor and belongs to someone else now).
    ClaimLost(JobId),
}

pub struct JobQueue {
    pub(crate) store: Arc<dyn JobStore>,
    provider: Arc<dyn GenerationProvider>,
    events: Arc<EventBus>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: QueueConfig,
    pub(crate) wakeup: Notify,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn GenerationProvider>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            provider,
            events,
            clock,
            config,
            wakeup: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Build a [`NewJob`] carrying the configured attempt limit.
    pub fn new_job(
        &self,
        submitted_by: i64,
        payload: serde_json::Value,
        priority: i32,
        estimated_secs: Option<i32>,
    ) -> NewJob {
        NewJob {
            submitted_by,
            payload,
            priority,
            max_attempts: self.config.max_attempts,
            estimated_secs,
        }
    }

    /// Persist a `Queued` job and wake an idle worker.
    pub async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        if job.max_attempts < 1 {
            return Err(QueueError::Validation(format!(
                "max_attempts must be at least 1, got {}",
                job.max_attempts
            )));
        }
        if !job.payload.is_object() {
            return Err(QueueError::Validation("Job payload must be a JSON object".to_string()));
        }

        let now = self.clock.now();
        let row = self.store.insert_job(&job, now).await?;
        self.publish(
            JobEvent::new(JobEventKind::Enqueued, row.id)
                .to_status(JobStatus::Queued)
                .at(now),
        );
        self.wakeup.notify_one();
        tracing::debug!(job_id = row.id, priority = row.priority, "Job enqueued");
        Ok(row.id)
    }

    pub async fn status(&self, id: JobId) -> Result<JobView, QueueError> {
        let job = self.store.find_job(id).await?.ok_or(QueueError::NotFound(id))?;
        JobView::try_from(job)
    }

    /// Remove a job that has not started. Returns `false` once it is
    /// running, finished or unknown.
    pub async fn cancel(&self, id: JobId) -> Result<bool, QueueError> {
        let removed = self.store.delete_queued(id).await?;
        if removed {
            self.publish(
                JobEvent::new(JobEventKind::Cancelled, id)
                    .from_status(JobStatus::Queued)
                    .at(self.clock.now()),
            );
        }
        Ok(removed)
    }

    /// Requeue (or dead-letter) running jobs whose heartbeat is older than
    /// the stall timeout. Returns the affected job ids.
    pub async fn recover_stalled(&self) -> Result<Vec<JobId>, QueueError> {
        let now = self.clock.now();
        let stalled_before = now - to_chrono(self.config.stall_timeout);
        let recovered = self.store.recover_stalled(stalled_before, now).await?;

        for job in &recovered {
            let mut event = JobEvent::new(JobEventKind::Recovered, job.id)
                .from_status(JobStatus::Running)
                .with_attempt(job.attempts)
                .at(now);
            if let Some(status) = job.status() {
                event = event.to_status(status);
            }
            if let Some(error) = &job.last_error {
                event = event.with_error(error.clone());
            }
            self.publish(event);
            tracing::warn!(
                job_id = job.id,
                attempts = job.attempts,
                status = %job.status().map_or("unknown", JobStatus::as_str),
                "Recovered stalled job",
            );
        }
        if recovered.iter().any(|j| j.status() == Some(JobStatus::Queued)) {
            self.wakeup.notify_one();
        }
        Ok(recovered.into_iter().map(|j| j.id).collect())
    }

    pub async fn counts(&self) -> Result<Vec<StatusCount>, QueueError> {
        Ok(self.store.count_by_status().await?)
    }

    /// Claim the next eligible job and run it to an outcome.
    ///
    /// Returns `None` when nothing is eligible. Used by every worker loop
    /// and directly by tests.
    pub async fn run_next(&self, worker: usize) -> Result<Option<ProcessOutcome>, QueueError> {
        let token = Uuid::new_v4();
        let Some(job) = self.store.claim_next(self.clock.now(), token).await? else {
            return Ok(None);
        };

        tracing::info!(job_id = job.id, worker, attempt = job.attempts, "Job claimed");
        self.publish(
            JobEvent::new(JobEventKind::Claimed, job.id)
                .from_status(JobStatus::Queued)
                .to_status(JobStatus::Running)
                .with_attempt(job.attempts)
                .at(self.clock.now()),
        );

        let timeout = self.timeout_for(&job);
        let result = tokio::select! {
            result = self.call_provider(&job, timeout) => result,
            never = self.keep_alive(job.id, token) => match never {},
        };

        self.record(&job, token, result).await.map(Some)
    }

    fn timeout_for(&self, job: &Job) -> Duration {
        match job.estimated_secs.and_then(|s| u32::try_from(s).ok()) {
            Some(estimate) => provider_timeout(estimate, self.config.provider_timeout_floor),
            None => self.config.provider_timeout_floor,
        }
    }

    async fn call_provider(&self, job: &Job, timeout: Duration) -> Result<GenerationOutput, ProviderError> {
        match tokio::time::timeout(timeout, self.provider.generate(&job.payload, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Retryable(format!(
                "Provider call timed out after {}s",
                timeout.as_secs_f64()
            ))),
        }
    }

    /// Refresh the heartbeat until dropped. Stops refreshing (but keeps
    /// pending) once the claim is lost.
    async fn keep_alive(&self, job_id: JobId, token: Uuid) -> Infallible {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.store.heartbeat(job_id, token, self.clock.now()).await {
                Ok(true) => tracing::trace!(job_id, "Heartbeat"),
                Ok(false) => {
                    tracing::warn!(job_id, "Claim lost while running, heartbeats stopped");
                    break;
                }
                Err(e) => tracing::warn!(job_id, error = %e, "Heartbeat failed"),
            }
        }
        std::future::pending().await
    }

    async fn record(
        &self,
        job: &Job,
        token: Uuid,
        result: Result<GenerationOutput, ProviderError>,
    ) -> Result<ProcessOutcome, QueueError> {
        let now = self.clock.now();
        let event = |kind| {
            JobEvent::new(kind, job.id)
                .from_status(JobStatus::Running)
                .with_attempt(job.attempts)
                .at(now)
        };

        match result {
            Ok(output) => {
                if !self.store.complete(job.id, token, &output.result, now).await? {
                    return Ok(self.claim_lost(job));
                }
                self.publish(event(JobEventKind::Completed).to_status(JobStatus::Completed));
                tracing::info!(job_id = job.id, attempt = job.attempts, "Job completed");
                Ok(ProcessOutcome::Completed(job.id))
            }
            Err(err) if err.is_retryable() && job.attempts < job.max_attempts => {
                let available_at = now + to_chrono(self.config.backoff.delay_for(job.attempts));
                if !self
                    .store
                    .requeue(job.id, token, err.message(), available_at, now)
                    .await?
                {
                    return Ok(self.claim_lost(job));
                }
                self.publish(
                    event(JobEventKind::RetryScheduled)
                        .to_status(JobStatus::Queued)
                        .with_error(err.message()),
                );
                tracing::info!(
                    job_id = job.id,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    %available_at,
                    error = %err,
                    "Job failed, retry scheduled",
                );
                Ok(ProcessOutcome::RetryScheduled {
                    job_id: job.id,
                    available_at,
                })
            }
            Err(err) => {
                let (status, code, kind) = if err.is_retryable() {
                    (JobStatus::DeadLettered, RETRIES_EXHAUSTED_CODE, JobEventKind::DeadLettered)
                } else {
                    (JobStatus::Failed, err.code(), JobEventKind::Failed)
                };
                let failure = JobFailure {
                    status,
                    message: err.message().to_string(),
                    code: code.to_string(),
                };
                if !self.store.fail(job.id, token, &failure, now).await? {
                    return Ok(self.claim_lost(job));
                }
                self.publish(event(kind).to_status(status).with_error(err.message()));
                // Tokens are debited at admission and never refunded.
                tracing::info!(
                    job_id = job.id,
                    submitted_by = job.submitted_by,
                    attempt = job.attempts,
                    status = %status,
                    error_code = code,
                    error = %err,
                    "Job failed permanently, reserved token not refunded",
                );
                Ok(if status == JobStatus::Failed {
                    ProcessOutcome::Failed(job.id)
                } else {
                    ProcessOutcome::DeadLettered(job.id)
                })
            }
        }
    }

    fn claim_lost(&self, job: &Job) -> ProcessOutcome {
        tracing::warn!(job_id = job.id, attempt = job.attempts, "Outcome discarded, claim no longer held");
        ProcessOutcome::ClaimLost(job.id)
    }

    fn publish(&self, event: JobEvent) {
        if let (Some(from), Some(to)) = (event.from, event.to) {
            if let Err(e) = state_machine::validate_transition(from.id(), to.id()) {
                tracing::error!(job_id = event.job_id, error = %e, "Unexpected job transition");
            }
        }
        self.events.publish(event);
    }
}

/// `std` to `chrono` duration; out-of-range values saturate at one year.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chorus_core::scheduling::BackoffPolicy;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::test_support::{harness, harness_with, payload, ScriptedProvider};

    #[tokio::test]
    async fn completed_job_reports_result_and_events() {
        let h = harness(ScriptedProvider::succeeding());
        let mut events = h.bus.subscribe();

        let id = h.queue.enqueue(h.queue.new_job(1, payload(0), 10, Some(30))).await.unwrap();
        assert_matches!(h.queue.run_next(0).await.unwrap(), Some(ProcessOutcome::Completed(j)) if j == id);

        let view = h.queue.status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.attempts, 1);
        assert!(view.result.is_some());
        assert!(view.completed_at.is_some());

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![JobEventKind::Enqueued, JobEventKind::Claimed, JobEventKind::Completed]
        );
    }

    #[tokio::test]
    async fn retry_waits_for_backoff_deadline() {
        let h = harness(ScriptedProvider::new(vec![Err(ProviderError::Retryable("busy".into()))]));
        let id = h.queue.enqueue(h.queue.new_job(1, payload(0), 10, None)).await.unwrap();

        let outcome = h.queue.run_next(0).await.unwrap().unwrap();
        let available_at = assert_matches!(outcome, ProcessOutcome::RetryScheduled { available_at, .. } => available_at);
        assert_eq!(available_at, h.clock.now() + ChronoDuration::seconds(2));

        assert!(h.queue.run_next(0).await.unwrap().is_none());
        h.clock.advance(ChronoDuration::milliseconds(1_999));
        assert!(h.queue.run_next(0).await.unwrap().is_none());
        h.clock.advance(ChronoDuration::milliseconds(1));
        assert_matches!(h.queue.run_next(0).await.unwrap(), Some(ProcessOutcome::Completed(_)));

        let view = h.queue.status(id).await.unwrap();
        assert_eq!(view.attempts, 2);
        assert_eq!(view.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn backoff_doubles_between_attempts() {
        let h = harness(ScriptedProvider::new(vec![
            Err(ProviderError::Retryable("a".into())),
            Err(ProviderError::Retryable("b".into())),
        ]));
        h.queue.enqueue(h.queue.new_job(1, payload(0), 10, None)).await.unwrap();

        let first = h.queue.run_next(0).await.unwrap().unwrap();
        let at1 = assert_matches!(first, ProcessOutcome::RetryScheduled { available_at, .. } => available_at);
        h.clock.set(at1);
        let second = h.queue.run_next(0).await.unwrap().unwrap();
        let at2 = assert_matches!(second, ProcessOutcome::RetryScheduled { available_at, .. } => available_at);
        assert_eq!(at2 - at1, ChronoDuration::seconds(4));
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let h = harness(ScriptedProvider::new(vec![
            Err(ProviderError::Retryable("1".into())),
            Err(ProviderError::Retryable("2".into())),
            Err(ProviderError::Retryable("3".into())),
        ]));
        let id = h.queue.enqueue(h.queue.new_job(1, payload(0), 10, None)).await.unwrap();

        for _ in 0..2 {
            assert_matches!(
                h.queue.run_next(0).await.unwrap(),
                Some(ProcessOutcome::RetryScheduled { .. })
            );
            h.clock.advance(ChronoDuration::minutes(10));
        }
        assert_matches!(h.queue.run_next(0).await.unwrap(), Some(ProcessOutcome::DeadLettered(_)));

        let view = h.queue.status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::DeadLettered);
        assert_eq!(view.attempts, 3);
        assert_eq!(view.error_code.as_deref(), Some(RETRIES_EXHAUSTED_CODE));
        assert_eq!(view.last_error.as_deref(), Some("3"));
        assert_eq!(h.provider.calls(), 3);

        h.clock.advance(ChronoDuration::hours(1));
        assert!(h.queue.run_next(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_error_fails_without_retry() {
        let h = harness(ScriptedProvider::new(vec![Err(ProviderError::Terminal("bad prompt".into()))]));
        let id = h.queue.enqueue(h.queue.new_job(1, payload(0), 10, None)).await.unwrap();

        assert_matches!(h.queue.run_next(0).await.unwrap(), Some(ProcessOutcome::Failed(_)));
        let view = h.queue.status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.status.is_dead_letter());
        assert_eq!(view.attempts, 1);
        assert_eq!(view.error_code.as_deref(), Some("provider_terminal"));
    }

    #[tokio::test]
    async fn dispatch_follows_priority_then_fifo() {
        let h = harness(ScriptedProvider::succeeding());
        for (n, priority) in [5, 1, 3].into_iter().enumerate() {
            h.queue.enqueue(h.queue.new_job(1, payload(n), priority, None)).await.unwrap();
            h.clock.advance(ChronoDuration::milliseconds(1));
        }
        h.queue.enqueue(h.queue.new_job(1, payload(3), 1, None)).await.unwrap();

        while h.queue.run_next(0).await.unwrap().is_some() {}
        // Payload `n` identifies the job; priorities were [5, 1, 3] then [1].
        assert_eq!(h.provider.payload_ids(), vec![1, 3, 2, 0]);
    }

    #[tokio::test]
    async fn cancel_only_removes_queued_jobs() {
        let h = harness(ScriptedProvider::succeeding());
        let mut events = h.bus.subscribe();
        let done = h.queue.enqueue(h.queue.new_job(1, payload(0), 1, None)).await.unwrap();
        let waiting = h.queue.enqueue(h.queue.new_job(1, payload(1), 2, None)).await.unwrap();
        h.queue.run_next(0).await.unwrap();

        assert!(!h.queue.cancel(done).await.unwrap());
        assert!(h.queue.cancel(waiting).await.unwrap());
        assert!(!h.queue.cancel(waiting).await.unwrap());
        assert_matches!(h.queue.status(waiting).await, Err(QueueError::NotFound(_)));
        assert!(std::iter::from_fn(|| events.try_recv().ok()).any(|e| e.kind == JobEventKind::Cancelled));
    }

    #[tokio::test]
    async fn counts_group_jobs_by_status() {
        let h = harness(ScriptedProvider::new(vec![Err(ProviderError::Terminal("bad prompt".into()))]));
        for n in 0..4 {
            h.queue.enqueue(h.queue.new_job(1, payload(n), 10, None)).await.unwrap();
        }
        h.queue.run_next(0).await.unwrap();
        h.queue.run_next(0).await.unwrap();

        let counts: Vec<(Option<JobStatus>, i64)> = h
            .queue
            .counts()
            .await
            .unwrap()
            .into_iter()
            .map(|c| (JobStatus::from_id(c.status_id), c.count))
            .collect();
        assert!(counts.contains(&(Some(JobStatus::Queued), 2)));
        assert!(counts.contains(&(Some(JobStatus::Completed), 1)));
        assert!(counts.contains(&(Some(JobStatus::Failed), 1)));
        assert_eq!(counts.iter().map(|(_, n)| n).sum::<i64>(), 4);
    }

    #[tokio::test]
    async fn stalled_job_is_requeued_then_dead_lettered() {
        let h = harness(ScriptedProvider::succeeding());
        let mut job = h.queue.new_job(1, payload(0), 10, None);
        job.max_attempts = 2;
        let id = h.queue.enqueue(job).await.unwrap();

        // A worker claims the job and dies without heartbeats.
        h.store.claim_next(h.clock.now(), Uuid::new_v4()).await.unwrap().unwrap();
        h.clock.advance(ChronoDuration::minutes(5));
        assert!(h.queue.recover_stalled().await.unwrap().is_empty());

        h.clock.advance(ChronoDuration::minutes(6));
        assert_eq!(h.queue.recover_stalled().await.unwrap(), vec![id]);
        let view = h.queue.status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Queued);
        assert_eq!(view.error_code.as_deref(), Some("stalled"));

        h.store.claim_next(h.clock.now(), Uuid::new_v4()).await.unwrap().unwrap();
        h.clock.advance(ChronoDuration::minutes(11));
        h.queue.recover_stalled().await.unwrap();
        assert_eq!(h.queue.status(id).await.unwrap().status, JobStatus::DeadLettered);
    }

    #[tokio::test]
    async fn provider_timeout_is_retryable() {
        let config = QueueConfig {
            provider_timeout_floor: Duration::from_millis(50),
            ..QueueConfig::default()
        };
        let h = harness_with(ScriptedProvider::succeeding().with_delay(Duration::from_secs(5)), config);
        let id = h.queue.enqueue(h.queue.new_job(1, payload(0), 10, None)).await.unwrap();

        assert_matches!(
            h.queue.run_next(0).await.unwrap(),
            Some(ProcessOutcome::RetryScheduled { .. })
        );
        let view = h.queue.status(id).await.unwrap();
        assert!(view.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn enqueue_rejects_bad_jobs() {
        let h = harness(ScriptedProvider::succeeding());
        let mut job = h.queue.new_job(1, payload(0), 10, None);
        job.max_attempts = 0;
        assert_matches!(h.queue.enqueue(job).await, Err(QueueError::Validation(_)));

        let job = h.queue.new_job(1, serde_json::json!("not an object"), 10, None);
        assert_matches!(h.queue.enqueue(job).await, Err(QueueError::Validation(_)));
    }

    #[tokio::test]
    async fn custom_backoff_policy_is_used() {
        let config = QueueConfig {
            backoff: BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(15)).unwrap(),
            ..QueueConfig::default()
        };
        let h = harness_with(
            ScriptedProvider::new(vec![Err(ProviderError::Retryable("x".into()))]),
            config,
        );
        h.queue.enqueue(h.queue.new_job(1, payload(0), 10, None)).await.unwrap();
        let outcome = h.queue.run_next(0).await.unwrap().unwrap();
        let at = assert_matches!(outcome, ProcessOutcome::RetryScheduled { available_at, .. } => available_at);
        assert_eq!(at - h.clock.now(), ChronoDuration::seconds(10));
    }
}
