//! Repository for the `jobs` table.
//!
//! Uses `JobStatus` from `models::status` for all status transitions.
//! Every write after a claim is fenced on `claim_token`, so only the worker
//! that owns a running job can move it out of `Running`.

use chorus_core::types::{JobId, Timestamp};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::job::{Job, JobFailure, NewJob, StatusCount};
use crate::models::status::JobStatus;

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, submitted_by, payload, priority, status_id, attempts, max_attempts, \
    claim_token, result, last_error, error_code, estimated_secs, \
    available_at, claimed_at, heartbeat_at, last_attempted_at, completed_at, \
    created_at, updated_at";

/// Error code recorded on jobs recovered from a stalled worker.
pub const STALLED_ERROR_CODE: &str = "stalled";

/// Provides CRUD and claim operations for generation jobs.
pub struct JobRepo;

impl JobRepo {
    /// Create a new queued job, dispatchable immediately.
    pub async fn insert(pool: &PgPool, input: &NewJob, now: Timestamp) -> Result<Job, sqlx::Error> {
        let query = format!(
            "INSERT INTO jobs \
                 (submitted_by, payload, priority, status_id, attempts, max_attempts, \
                  estimated_secs, available_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $7, $7) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(input.submitted_by)
            .bind(&input.payload)
            .bind(input.priority)
            .bind(JobStatus::Queued.id())
            .bind(input.max_attempts)
            .bind(input.estimated_secs)
            .bind(now)
            .fetch_one(pool)
            .await
    }

    /// Atomically claim the next eligible queued job.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` to prevent double-dispatch
    /// when several worker processes share the table. Lower priority values
    /// win; ties are broken by creation time and then id.
    pub async fn claim_next(
        pool: &PgPool,
        now: Timestamp,
        claim_token: Uuid,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $1, claim_token = $2, attempts = attempts + 1, \
                 claimed_at = $3, heartbeat_at = $3, last_attempted_at = $3, updated_at = $3 \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE status_id = $4 AND available_at <= $3 \
                 ORDER BY priority ASC, created_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(JobStatus::Running.id())
            .bind(claim_token)
            .bind(now)
            .bind(JobStatus::Queued.id())
            .fetch_optional(pool)
            .await
    }

    /// Refresh `heartbeat_at` for a job the caller still owns.
    pub async fn heartbeat(
        pool: &PgPool,
        job_id: JobId,
        claim_token: Uuid,
        now: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET heartbeat_at = $3, updated_at = $3 \
             WHERE id = $1 AND claim_token = $2 AND status_id = $4",
        )
        .bind(job_id)
        .bind(claim_token)
        .bind(now)
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a running job as completed with its result payload.
    pub async fn complete(
        pool: &PgPool,
        job_id: JobId,
        claim_token: Uuid,
        result: &serde_json::Value,
        now: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            "UPDATE jobs \
             SET status_id = $3, result = $4, completed_at = $5, updated_at = $5, \
                 claim_token = NULL, last_error = NULL, error_code = NULL \
             WHERE id = $1 AND claim_token = $2 AND status_id = $6",
        )
        .bind(job_id)
        .bind(claim_token)
        .bind(JobStatus::Completed.id())
        .bind(result)
        .bind(now)
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Put a running job back in the queue after a retryable failure.
    ///
    /// The job is invisible to `claim_next` until `available_at`.
    pub async fn requeue(
        pool: &PgPool,
        job_id: JobId,
        claim_token: Uuid,
        error: &str,
        available_at: Timestamp,
        now: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            "UPDATE jobs \
             SET status_id = $3, last_error = $4, error_code = 'retryable', \
                 available_at = $5, updated_at = $6, \
                 claim_token = NULL, claimed_at = NULL, heartbeat_at = NULL \
             WHERE id = $1 AND claim_token = $2 AND status_id = $7 \
               AND attempts < max_attempts",
        )
        .bind(job_id)
        .bind(claim_token)
        .bind(JobStatus::Queued.id())
        .bind(error)
        .bind(available_at)
        .bind(now)
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Move a running job into a terminal failure state.
    pub async fn fail(
        pool: &PgPool,
        job_id: JobId,
        claim_token: Uuid,
        failure: &JobFailure,
        now: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            "UPDATE jobs \
             SET status_id = $3, last_error = $4, error_code = $5, \
                 completed_at = $6, updated_at = $6, claim_token = NULL \
             WHERE id = $1 AND claim_token = $2 AND status_id = $7",
        )
        .bind(job_id)
        .bind(claim_token)
        .bind(failure.status.id())
        .bind(&failure.message)
        .bind(&failure.code)
        .bind(now)
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Find a job by its ID.
    pub async fn find_by_id(pool: &PgPool, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Delete a job if it is still queued.
    ///
    /// Returns `true` if the job was removed, `false` if it is running,
    /// terminal, or unknown.
    pub async fn delete_queued(pool: &PgPool, id: JobId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND status_id = $2")
            .bind(id)
            .bind(JobStatus::Queued.id())
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Release running jobs whose heartbeat predates `stalled_before`.
    ///
    /// Exhausted jobs are dead-lettered in the same statement.
    pub async fn recover_stalled(
        pool: &PgPool,
        stalled_before: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = CASE WHEN attempts >= max_attempts THEN $1 ELSE $2 END, \
                 completed_at = CASE WHEN attempts >= max_attempts THEN $3 ELSE NULL END, \
                 last_error = 'worker stopped sending heartbeats', \
                 error_code = '{STALLED_ERROR_CODE}', \
                 available_at = $3, updated_at = $3, \
                 claim_token = NULL, claimed_at = NULL, heartbeat_at = NULL \
             WHERE status_id = $4 AND heartbeat_at < $5 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(JobStatus::DeadLettered.id())
            .bind(JobStatus::Queued.id())
            .bind(now)
            .bind(JobStatus::Running.id())
            .bind(stalled_before)
            .fetch_all(pool)
            .await
    }

    /// Count jobs per status.
    pub async fn count_by_status(pool: &PgPool) -> Result<Vec<StatusCount>, sqlx::Error> {
        sqlx::query_as::<_, StatusCount>(
            "SELECT status_id, COUNT(*) AS count FROM jobs GROUP BY status_id ORDER BY status_id",
        )
        .fetch_all(pool)
        .await
    }
}
