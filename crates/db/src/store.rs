//! Persistence seams used by the engines.
//!
//! The engines never touch `PgPool` directly. They hold `Arc<dyn JobStore>`
//! and `Arc<dyn TokenStore>` so the Postgres implementation
//! ([`PgStore`](crate::pg::PgStore)) can be swapped for the in-memory fake
//! ([`MemoryStore`](crate::memory::MemoryStore)) in tests.
//!
//! Every mutating method is either idempotent or a single conditional
//! update; callers may retry on [`StoreError::is_retryable`].

use async_trait::async_trait;
use chorus_core::day_key::DayKey;
use chorus_core::types::{JobId, Timestamp, UserId};
use uuid::Uuid;

use crate::models::job::{Job, JobFailure, NewJob, StatusCount};
use crate::models::token::{AllocationGrant, NewTokenPool, RotationGrant, TokenPool, UserAllocation};
use crate::models::user::User;

/// Errors raised by a store implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A database error from sqlx.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The backing store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether the failed operation can safely be retried by the caller.
    ///
    /// Connection loss, pool exhaustion, serialization failures and
    /// deadlocks are transient; constraint violations and decode errors are
    /// not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
                | sqlx::Error::Tls(_) => true,
                sqlx::Error::Database(db_err) => {
                    // SQLSTATE class 08 (connection) and 40 (transaction rollback).
                    db_err
                        .code()
                        .is_some_and(|code| code.starts_with("08") || code.starts_with("40"))
                }
                _ => false,
            },
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Job table operations.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a `Queued` job, immediately eligible for dispatch.
    async fn insert_job(&self, job: &NewJob, now: Timestamp) -> StoreResult<Job>;

    /// Atomically claim the next eligible job.
    ///
    /// Eligible means `Queued` with `available_at <= now`. Order is priority
    /// ascending, then creation time, then id. The claimed job is moved to
    /// `Running`, its attempt count is incremented and `claim_token` set.
    async fn claim_next(&self, now: Timestamp, claim_token: Uuid) -> StoreResult<Option<Job>>;

    /// Refresh the heartbeat of a running job. `false` if the caller no
    /// longer owns it.
    async fn heartbeat(&self, id: JobId, claim_token: Uuid, now: Timestamp) -> StoreResult<bool>;

    /// `Running -> Completed`, fenced on the claim token.
    async fn complete(
        &self,
        id: JobId,
        claim_token: Uuid,
        result: &serde_json::Value,
        now: Timestamp,
    ) -> StoreResult<bool>;

    /// `Running -> Queued` after a retryable failure, not dispatchable
    /// before `available_at`. Fenced on the claim token.
    async fn requeue(
        &self,
        id: JobId,
        claim_token: Uuid,
        error: &str,
        available_at: Timestamp,
        now: Timestamp,
    ) -> StoreResult<bool>;

    /// `Running -> Failed | DeadLettered`, fenced on the claim token.
    async fn fail(
        &self,
        id: JobId,
        claim_token: Uuid,
        failure: &JobFailure,
        now: Timestamp,
    ) -> StoreResult<bool>;

    async fn find_job(&self, id: JobId) -> StoreResult<Option<Job>>;

    /// Remove a job that is still `Queued`. `false` otherwise.
    async fn delete_queued(&self, id: JobId) -> StoreResult<bool>;

    /// Release running jobs whose heartbeat is older than `stalled_before`.
    ///
    /// Jobs with attempts left go back to `Queued` (eligible at `now`);
    /// exhausted ones are dead-lettered. Returns the updated rows.
    async fn recover_stalled(&self, stalled_before: Timestamp, now: Timestamp) -> StoreResult<Vec<Job>>;

    /// Job counts grouped by status.
    async fn count_by_status(&self) -> StoreResult<Vec<StatusCount>>;
}

/// Token pool and allocation operations.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Insert the day's pool unless one exists; always returns the
    /// persisted row (the winner's, when racing).
    async fn insert_pool_if_absent(&self, pool: &NewTokenPool, now: Timestamp) -> StoreResult<TokenPool>;

    async fn find_pool(&self, day: DayKey) -> StoreResult<Option<TokenPool>>;

    /// Upsert the granted columns for (user, day). Used columns are left
    /// untouched; grants never drop below what is already used and keep any
    /// rotation bonus credited earlier.
    async fn upsert_allocation(&self, grant: &AllocationGrant, now: Timestamp) -> StoreResult<UserAllocation>;

    /// Mark the day's allocations of inactive users inactive. Returns the
    /// number of rows changed.
    async fn deactivate_inactive_allocations(&self, day: DayKey, now: Timestamp) -> StoreResult<u64>;

    async fn find_allocation(&self, user_id: UserId, day: DayKey) -> StoreResult<Option<UserAllocation>>;

    async fn list_allocations(&self, day: DayKey) -> StoreResult<Vec<UserAllocation>>;

    /// Single conditional debit of `amount` tokens, free before paid.
    ///
    /// Succeeds only if the user and allocation are active and
    /// `total_used + amount <= total_granted`. Returns the updated row, or
    /// `None` without mutating anything.
    async fn try_reserve(
        &self,
        user_id: UserId,
        day: DayKey,
        amount: i64,
        now: Timestamp,
    ) -> StoreResult<Option<UserAllocation>>;

    /// Single conditional credit of `amount` previously reserved tokens,
    /// paid before free. `None` if fewer than `amount` tokens are used.
    async fn try_release(
        &self,
        user_id: UserId,
        day: DayKey,
        amount: i64,
        now: Timestamp,
    ) -> StoreResult<Option<UserAllocation>>;

    /// Claim the day's rotation and credit `grants` atomically.
    ///
    /// Returns `false` (and changes nothing) when the pool is missing or
    /// already rotated. Each credit is conditional on the allocation's cap.
    async fn apply_rotation(
        &self,
        day: DayKey,
        grants: &[RotationGrant],
        now: Timestamp,
    ) -> StoreResult<bool>;
}

/// Read access to users owned by the account system.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, id: UserId) -> StoreResult<Option<User>>;

    async fn list_active_users(&self) -> StoreResult<Vec<User>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_retryable() {
        assert!(StoreError::Unavailable("down".into()).is_retryable());
    }

    #[test]
    fn pool_timeout_is_retryable() {
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_retryable());
    }

    #[test]
    fn row_not_found_is_not_retryable() {
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_retryable());
    }
}
