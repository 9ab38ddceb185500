//! Generation job entity and DTOs.

use chorus_core::types::{JobId, Timestamp, UserId};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use super::status::{JobStatus, StatusId};

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: JobId,
    pub submitted_by: UserId,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status_id: StatusId,
    pub attempts: i32,
    pub max_attempts: i32,
    /// Lease of the worker currently running the job.
    pub claim_token: Option<Uuid>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub error_code: Option<String>,
    pub estimated_secs: Option<i32>,
    /// The job is not dispatched before this instant (retry backoff).
    pub available_at: Timestamp,
    pub claimed_at: Option<Timestamp>,
    pub heartbeat_at: Option<Timestamp>,
    pub last_attempted_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    /// Decoded status. Unknown IDs only appear if the lookup table was
    /// extended without updating [`JobStatus`].
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::from_id(self.status_id)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Input for creating a queued job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub submitted_by: UserId,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: i32,
    pub estimated_secs: Option<i32>,
}

/// How a claimed job ended when it did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    /// `Failed` or `DeadLettered`.
    pub status: JobStatus,
    pub message: String,
    /// Stable machine-readable reason, e.g. `provider_terminal`.
    pub code: String,
}

/// Number of jobs currently in one status.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StatusCount {
    pub status_id: StatusId,
    pub count: i64,
}
