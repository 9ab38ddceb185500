//! Caller-facing snapshot of a job.

use chorus_core::types::{JobId, Timestamp, UserId};
use chorus_db::models::job::Job;
use chorus_db::models::status::JobStatus;
use serde::Serialize;

use crate::error::QueueError;

/// What `status` reports: lifecycle state, attempt counters, outcome and
/// timestamps. Internal lease fields are left out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub submitted_by: UserId,
    pub status: JobStatus,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub error_code: Option<String>,
    pub estimated_secs: Option<i32>,
    pub created_at: Timestamp,
    /// Earliest next dispatch while a retry is pending.
    pub available_at: Timestamp,
    pub last_attempted_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl JobView {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl TryFrom<Job> for JobView {
    type Error = QueueError;

    fn try_from(job: Job) -> Result<Self, Self::Error> {
        let status = job.status().ok_or(QueueError::UnknownStatus {
            id: job.id,
            status_id: job.status_id,
        })?;
        Ok(Self {
            id: job.id,
            submitted_by: job.submitted_by,
            status,
            priority: job.priority,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            result: job.result,
            last_error: job.last_error,
            error_code: job.error_code,
            estimated_secs: job.estimated_secs,
            created_at: job.created_at,
            available_at: job.available_at,
            last_attempted_at: job.last_attempted_at,
            completed_at: job.completed_at,
        })
    }
}
