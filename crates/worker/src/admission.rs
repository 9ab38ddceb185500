//! Admission facade: the single entry point callers use to submit
//! generation requests.
//!
//! Submitting reserves one token for the current day, then enqueues the job.
//! A denied reservation never creates a job. If enqueueing fails after a
//! successful reservation, the token is released again.

use std::sync::Arc;

use chorus_core::clock::Clock;
use chorus_core::day_key::DayCalendar;
use chorus_core::error::CoreError;
use chorus_core::generation::{estimate_generation_secs, GenerationRequest};
use chorus_core::scheduling::PRIORITY_NORMAL;
use chorus_core::tiers::Tier;
use chorus_core::types::{JobId, UserId};
use chorus_economy::{DenialReason, EconomyError, Reservation, TokenEconomy};
use chorus_queue::{JobQueue, JobView, QueueError};
use serde::Serialize;

/// Tokens debited per admitted job.
pub const TOKENS_PER_JOB: i64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    InvalidRequest(#[from] CoreError),

    #[error(transparent)]
    Economy(#[from] EconomyError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl AdmissionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AdmissionError::InvalidRequest(_) => false,
            AdmissionError::Economy(e) => e.is_retryable(),
            AdmissionError::Queue(e) => e.is_retryable(),
        }
    }
}

/// Result of [`Admission::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdmissionOutcome {
    Admitted { job_id: JobId, estimated_seconds: u32 },
    Denied { reason: DenialReason },
}

/// Maps a submitter's tier to a queue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityPolicy {
    default_priority: i32,
}

impl PriorityPolicy {
    pub fn new(default_priority: i32) -> Self {
        Self { default_priority }
    }

    // TODO: per-tier priorities (e.g. paid tiers ahead of free) need a product
    // decision; until then every tier shares the default priority.
    pub fn priority_for(&self, _tier: Tier) -> i32 {
        self.default_priority
    }
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self::new(PRIORITY_NORMAL)
    }
}

pub struct Admission {
    economy: Arc<TokenEconomy>,
    queue: Arc<JobQueue>,
    clock: Arc<dyn Clock>,
    calendar: DayCalendar,
    priority: PriorityPolicy,
}

impl Admission {
    pub fn new(
        economy: Arc<TokenEconomy>,
        queue: Arc<JobQueue>,
        clock: Arc<dyn Clock>,
        calendar: DayCalendar,
        priority: PriorityPolicy,
    ) -> Self {
        Self {
            economy,
            queue,
            clock,
            calendar,
            priority,
        }
    }

    /// Validate, reserve a token and enqueue a generation job.
    pub async fn submit(
        &self,
        user_id: UserId,
        request: GenerationRequest,
    ) -> Result<AdmissionOutcome, AdmissionError> {
        let estimated_seconds = estimate_generation_secs(request.duration());
        let payload = request.into_payload()?;
        let day = self.calendar.day_key(self.clock.now());

        let allocation = match self.economy.reserve(user_id, day, TOKENS_PER_JOB).await? {
            Reservation::Granted(allocation) => allocation,
            Reservation::Denied(reason) => {
                tracing::info!(user_id, day_key = %day, reason = reason.code(), "Submission denied");
                return Ok(AdmissionOutcome::Denied { reason });
            }
        };

        let job = self.queue.new_job(
            user_id,
            payload,
            self.priority.priority_for(allocation.tier),
            i32::try_from(estimated_seconds).ok(),
        );
        let job_id = match self.queue.enqueue(job).await {
            Ok(id) => id,
            Err(e) => {
                if let Err(release_err) = self.economy.release(user_id, day, TOKENS_PER_JOB).await {
                    tracing::error!(
                        user_id,
                        day_key = %day,
                        error = %release_err,
                        "Failed to release token after enqueue failure",
                    );
                }
                return Err(e.into());
            }
        };

        tracing::info!(
            job_id,
            user_id,
            tier = %allocation.tier,
            remaining = allocation.remaining(),
            estimated_seconds,
            "Submission admitted",
        );
        Ok(AdmissionOutcome::Admitted {
            job_id,
            estimated_seconds,
        })
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobView, AdmissionError> {
        Ok(self.queue.status(job_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chorus_core::day_key::DayKey;
    use chorus_db::models::status::JobStatus;
    use chorus_queue::{ProcessOutcome, QueueConfig};

    use super::*;
    use crate::config::WorkerConfig;
    use crate::test_support::{stack, stack_with, Stack};

    fn day() -> DayKey {
        DayKey::from_ymd(2026, 4, 1).unwrap()
    }

    async fn admitted(s: &Stack, user_id: UserId) -> JobId {
        let outcome = s.admission.submit(user_id, GenerationRequest::new("rainy jazz")).await.unwrap();
        assert_matches!(outcome, AdmissionOutcome::Admitted { job_id, .. } => job_id)
    }

    #[tokio::test]
    async fn admitted_job_is_queued_then_completed() {
        let s = stack();
        let user = s.store.add_user(Tier::Pro);
        s.economy.allocate_daily(day()).await.unwrap();

        let request = GenerationRequest::new("synthwave").with_duration(60);
        let outcome = s.admission.submit(user.id, request).await.unwrap();
        let (job_id, estimate) = assert_matches!(
            outcome,
            AdmissionOutcome::Admitted { job_id, estimated_seconds } => (job_id, estimated_seconds)
        );
        assert_eq!(estimate, estimate_generation_secs(60));

        let view = s.admission.status(job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Queued);
        assert_eq!(view.priority, PRIORITY_NORMAL);
        assert_eq!(view.estimated_secs, Some(estimate as i32));
        assert_eq!(s.economy.balance(user.id, day()).await.unwrap().unwrap().total_used, 1);

        assert_eq!(
            s.queue.run_next(0).await.unwrap(),
            Some(ProcessOutcome::Completed(job_id))
        );
        let view = s.admission.status(job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.result.unwrap()["prompt"], "synthwave");
    }

    #[tokio::test]
    async fn sixth_submission_is_denied_and_creates_no_job() {
        let s = stack();
        let user = s.store.add_user(Tier::Free);
        s.economy.allocate_daily(day()).await.unwrap();

        for _ in 0..5 {
            admitted(&s, user.id).await;
        }
        let outcome = s
            .admission
            .submit(user.id, GenerationRequest::new("one more"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AdmissionOutcome::Denied {
                reason: DenialReason::InsufficientTokens
            }
        );
        assert_eq!(s.store.jobs().len(), 5);
    }

    #[tokio::test]
    async fn inactive_user_is_denied() {
        let s = stack();
        let user = s.store.add_user(Tier::Studio);
        s.economy.allocate_daily(day()).await.unwrap();
        s.store.set_user_active(user.id, false);

        let outcome = s.admission.submit(user.id, GenerationRequest::new("x")).await.unwrap();
        assert_matches!(outcome, AdmissionOutcome::Denied { reason: DenialReason::UserInactive });
        assert!(s.store.jobs().is_empty());
    }

    #[tokio::test]
    async fn invalid_request_spends_nothing() {
        let s = stack();
        let user = s.store.add_user(Tier::Free);
        s.economy.allocate_daily(day()).await.unwrap();

        let err = s
            .admission
            .submit(user.id, GenerationRequest::new("   "))
            .await
            .unwrap_err();
        assert_matches!(err, AdmissionError::InvalidRequest(_));
        assert!(!err.is_retryable());
        assert_eq!(s.economy.balance(user.id, day()).await.unwrap().unwrap().total_used, 0);
    }

    #[tokio::test]
    async fn denied_outcome_serializes_with_stable_code() {
        let outcome = AdmissionOutcome::Denied {
            reason: DenialReason::InsufficientTokens,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "denied");
        assert_eq!(json["reason"], "insufficient_tokens");
    }

    #[tokio::test]
    async fn unknown_job_status_is_an_error() {
        let s = stack();
        assert_matches!(
            s.admission.status(404).await,
            Err(AdmissionError::Queue(QueueError::NotFound(404)))
        );
    }

    #[tokio::test]
    async fn configured_default_priority_reaches_the_job() {
        let config = WorkerConfig::from_lookup(|name| match name {
            "DATABASE_URL" => Some("postgres://localhost/chorus".to_string()),
            "PROVIDER_URL" => Some("http://provider:8080".to_string()),
            "DEFAULT_PRIORITY" => Some("3".to_string()),
            _ => None,
        })
        .unwrap();
        let s = stack();
        let admission = Admission::new(
            s.economy.clone(),
            s.queue.clone(),
            s.clock.clone(),
            config.calendar,
            config.priority_policy(),
        );
        let user = s.store.add_user(Tier::Starter);
        s.economy.allocate_daily(day()).await.unwrap();

        let outcome = admission.submit(user.id, GenerationRequest::new("bossa")).await.unwrap();
        let job_id = assert_matches!(outcome, AdmissionOutcome::Admitted { job_id, .. } => job_id);
        assert_eq!(admission.status(job_id).await.unwrap().priority, 3);
    }

    #[test]
    fn every_tier_shares_the_default_priority() {
        let policy = PriorityPolicy::new(7);
        for tier in [Tier::Free, Tier::Starter, Tier::Pro, Tier::Studio] {
            assert_eq!(policy.priority_for(tier), 7);
        }
    }

    #[tokio::test]
    async fn enqueue_failure_releases_the_token() {
        let s = stack_with(QueueConfig {
            max_attempts: 0,
            ..QueueConfig::default()
        });
        let user = s.store.add_user(Tier::Free);
        s.economy.allocate_daily(day()).await.unwrap();

        let err = s
            .admission
            .submit(user.id, GenerationRequest::new("lofi"))
            .await
            .unwrap_err();
        assert_matches!(err, AdmissionError::Queue(QueueError::Validation(_)));
        assert!(s.store.jobs().is_empty());
        assert_eq!(s.economy.balance(user.id, day()).await.unwrap().unwrap().total_used, 0);
    }
}
