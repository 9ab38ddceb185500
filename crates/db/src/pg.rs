//! Postgres-backed implementation of the store traits.
//!
//! A thin adapter: every method delegates to the matching repository
//! function. Only [`TokenStore::apply_rotation`] opens a transaction, because
//! it must claim the pool flag and credit allocations as one unit.

use async_trait::async_trait;
use chorus_core::day_key::DayKey;
use chorus_core::types::{JobId, Timestamp, UserId};
use uuid::Uuid;

use crate::models::job::{Job, JobFailure, NewJob, StatusCount};
use crate::models::token::{AllocationGrant, NewTokenPool, RotationGrant, TokenPool, UserAllocation};
use crate::models::user::User;
use crate::repositories::{AllocationRepo, JobRepo, TokenPoolRepo, UserRepo};
use crate::store::{JobStore, StoreResult, TokenStore, UserStore};
use crate::DbPool;

/// Store backed by a shared Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_job(&self, job: &NewJob, now: Timestamp) -> StoreResult<Job> {
        Ok(JobRepo::insert(&self.pool, job, now).await?)
    }

    async fn claim_next(&self, now: Timestamp, claim_token: Uuid) -> StoreResult<Option<Job>> {
        Ok(JobRepo::claim_next(&self.pool, now, claim_token).await?)
    }

    async fn heartbeat(&self, id: JobId, claim_token: Uuid, now: Timestamp) -> StoreResult<bool> {
        Ok(JobRepo::heartbeat(&self.pool, id, claim_token, now).await?)
    }

    async fn complete(
        &self,
        id: JobId,
        claim_token: Uuid,
        result: &serde_json::Value,
        now: Timestamp,
    ) -> StoreResult<bool> {
        Ok(JobRepo::complete(&self.pool, id, claim_token, result, now).await?)
    }

    async fn requeue(
        &self,
        id: JobId,
        claim_token: Uuid,
        error: &str,
        available_at: Timestamp,
        now: Timestamp,
    ) -> StoreResult<bool> {
        Ok(JobRepo::requeue(&self.pool, id, claim_token, error, available_at, now).await?)
    }

    async fn fail(
        &self,
        id: JobId,
        claim_token: Uuid,
        failure: &JobFailure,
        now: Timestamp,
    ) -> StoreResult<bool> {
        Ok(JobRepo::fail(&self.pool, id, claim_token, failure, now).await?)
    }

    async fn find_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(JobRepo::find_by_id(&self.pool, id).await?)
    }

    async fn delete_queued(&self, id: JobId) -> StoreResult<bool> {
        Ok(JobRepo::delete_queued(&self.pool, id).await?)
    }

    async fn recover_stalled(&self, stalled_before: Timestamp, now: Timestamp) -> StoreResult<Vec<Job>> {
        Ok(JobRepo::recover_stalled(&self.pool, stalled_before, now).await?)
    }

    async fn count_by_status(&self) -> StoreResult<Vec<StatusCount>> {
        Ok(JobRepo::count_by_status(&self.pool).await?)
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn insert_pool_if_absent(&self, pool: &NewTokenPool, now: Timestamp) -> StoreResult<TokenPool> {
        Ok(TokenPoolRepo::insert_if_absent(&self.pool, pool, now).await?)
    }

    async fn find_pool(&self, day: DayKey) -> StoreResult<Option<TokenPool>> {
        Ok(TokenPoolRepo::find_by_day(&self.pool, day).await?)
    }

    async fn upsert_allocation(&self, grant: &AllocationGrant, now: Timestamp) -> StoreResult<UserAllocation> {
        Ok(AllocationRepo::upsert_grant(&self.pool, grant, now).await?)
    }

    async fn deactivate_inactive_allocations(&self, day: DayKey, now: Timestamp) -> StoreResult<u64> {
        Ok(AllocationRepo::deactivate_for_inactive_users(&self.pool, day, now).await?)
    }

    async fn find_allocation(&self, user_id: UserId, day: DayKey) -> StoreResult<Option<UserAllocation>> {
        Ok(AllocationRepo::find(&self.pool, user_id, day).await?)
    }

    async fn list_allocations(&self, day: DayKey) -> StoreResult<Vec<UserAllocation>> {
        Ok(AllocationRepo::list_by_day(&self.pool, day).await?)
    }

    async fn try_reserve(
        &self,
        user_id: UserId,
        day: DayKey,
        amount: i64,
        now: Timestamp,
    ) -> StoreResult<Option<UserAllocation>> {
        Ok(AllocationRepo::reserve(&self.pool, user_id, day, amount, now).await?)
    }

    async fn try_release(
        &self,
        user_id: UserId,
        day: DayKey,
        amount: i64,
        now: Timestamp,
    ) -> StoreResult<Option<UserAllocation>> {
        Ok(AllocationRepo::release(&self.pool, user_id, day, amount, now).await?)
    }

    async fn apply_rotation(
        &self,
        day: DayKey,
        grants: &[RotationGrant],
        now: Timestamp,
    ) -> StoreResult<bool> {
        let planned: i64 = grants.iter().map(|g| g.amount).sum();
        let mut tx = self.pool.begin().await?;

        if !TokenPoolRepo::mark_rotated(&mut tx, day, planned, now).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        let mut credited = 0;
        for grant in grants {
            if AllocationRepo::credit_rotation(&mut tx, day, grant, now).await? {
                credited += grant.amount;
            } else {
                tracing::warn!(
                    user_id = grant.user_id,
                    day = %day,
                    amount = grant.amount,
                    "Rotation credit skipped: allocation changed since planning",
                );
            }
        }

        if credited < planned {
            TokenPoolRepo::return_rotation_shortfall(&mut tx, day, planned - credited).await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_user(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(UserRepo::find_by_id(&self.pool, id).await?)
    }

    async fn list_active_users(&self) -> StoreResult<Vec<User>> {
        Ok(UserRepo::list_active(&self.pool).await?)
    }
}
