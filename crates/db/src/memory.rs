//! In-memory implementation of the store traits.
//!
//! Mirrors the Postgres statements in `repositories` one-for-one: each
//! trait method runs under a single mutex acquisition, which gives the same
//! all-or-nothing behaviour as the conditional `UPDATE`s it stands in for.
//! Only suitable for a single process; used by engine tests and local runs
//! without a database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chorus_core::day_key::DayKey;
use chorus_core::tiers::Tier;
use chorus_core::types::{DbId, JobId, Timestamp, UserId};
use chrono::Utc;
use uuid::Uuid;

use crate::models::job::{Job, JobFailure, NewJob, StatusCount};
use crate::models::status::JobStatus;
use crate::models::token::{AllocationGrant, NewTokenPool, RotationGrant, TokenPool, UserAllocation};
use crate::models::user::User;
use crate::repositories::job_repo::STALLED_ERROR_CODE;
use crate::store::{JobStore, StoreError, StoreResult, TokenStore, UserStore};

#[derive(Debug, Default)]
struct Inner {
    last_id: DbId,
    jobs: BTreeMap<JobId, Job>,
    pools: BTreeMap<DayKey, TokenPool>,
    /// Keyed by (day, user) so a day's rows iterate in user order.
    allocations: BTreeMap<(DayKey, UserId), UserAllocation>,
    users: BTreeMap<UserId, User>,
}

impl Inner {
    fn next_id(&mut self) -> DbId {
        self.last_id += 1;
        self.last_id
    }
}

/// Process-local store for tests and database-less runs.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Register an active user in `tier`.
    pub fn add_user(&self, tier: Tier) -> User {
        let mut inner = self.lock();
        let now = Utc::now();
        let user = User {
            id: inner.next_id(),
            tier,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        inner.users.insert(user.id, user.clone());
        user
    }

    /// Soft-delete or restore a user.
    pub fn set_user_active(&self, id: UserId, active: bool) -> bool {
        let mut inner = self.lock();
        match inner.users.get_mut(&id) {
            Some(user) => {
                user.is_active = active;
                user.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Simulate an outage: while unavailable every trait method fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// All jobs, in id order.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock().jobs.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checked(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        Ok(self.lock())
    }
}

fn running_job_mut<'a>(inner: &'a mut Inner, id: JobId, claim_token: Uuid) -> Option<&'a mut Job> {
    inner
        .jobs
        .get_mut(&id)
        .filter(|j| j.status_id == JobStatus::Running.id() && j.claim_token == Some(claim_token))
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &NewJob, now: Timestamp) -> StoreResult<Job> {
        let mut inner = self.checked()?;
        let row = Job {
            id: inner.next_id(),
            submitted_by: job.submitted_by,
            payload: job.payload.clone(),
            priority: job.priority,
            status_id: JobStatus::Queued.id(),
            attempts: 0,
            max_attempts: job.max_attempts,
            claim_token: None,
            result: None,
            last_error: None,
            error_code: None,
            estimated_secs: job.estimated_secs,
            available_at: now,
            claimed_at: None,
            heartbeat_at: None,
            last_attempted_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.jobs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn claim_next(&self, now: Timestamp, claim_token: Uuid) -> StoreResult<Option<Job>> {
        let mut inner = self.checked()?;
        let next = inner
            .jobs
            .values()
            .filter(|j| j.status_id == JobStatus::Queued.id() && j.available_at <= now)
            .min_by_key(|j| (j.priority, j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status_id = JobStatus::Running.id();
        job.claim_token = Some(claim_token);
        job.attempts += 1;
        job.claimed_at = Some(now);
        job.heartbeat_at = Some(now);
        job.last_attempted_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, id: JobId, claim_token: Uuid, now: Timestamp) -> StoreResult<bool> {
        let mut inner = self.checked()?;
        Ok(match running_job_mut(&mut inner, id, claim_token) {
            Some(job) => {
                job.heartbeat_at = Some(now);
                job.updated_at = now;
                true
            }
            None => false,
        })
    }

    async fn complete(
        &self,
        id: JobId,
        claim_token: Uuid,
        result: &serde_json::Value,
        now: Timestamp,
    ) -> StoreResult<bool> {
        let mut inner = self.checked()?;
        Ok(match running_job_mut(&mut inner, id, claim_token) {
            Some(job) => {
                job.status_id = JobStatus::Completed.id();
                job.result = Some(result.clone());
                job.completed_at = Some(now);
                job.updated_at = now;
                job.claim_token = None;
                job.last_error = None;
                job.error_code = None;
                true
            }
            None => false,
        })
    }

    async fn requeue(
        &self,
        id: JobId,
        claim_token: Uuid,
        error: &str,
        available_at: Timestamp,
        now: Timestamp,
    ) -> StoreResult<bool> {
        let mut inner = self.checked()?;
        Ok(match running_job_mut(&mut inner, id, claim_token) {
            Some(job) if job.attempts < job.max_attempts => {
                job.status_id = JobStatus::Queued.id();
                job.last_error = Some(error.to_string());
                job.error_code = Some("retryable".to_string());
                job.available_at = available_at;
                job.updated_at = now;
                job.claim_token = None;
                job.claimed_at = None;
                job.heartbeat_at = None;
                true
            }
            _ => false,
        })
    }

    async fn fail(
        &self,
        id: JobId,
        claim_token: Uuid,
        failure: &JobFailure,
        now: Timestamp,
    ) -> StoreResult<bool> {
        let mut inner = self.checked()?;
        Ok(match running_job_mut(&mut inner, id, claim_token) {
            Some(job) => {
                job.status_id = failure.status.id();
                job.last_error = Some(failure.message.clone());
                job.error_code = Some(failure.code.clone());
                job.completed_at = Some(now);
                job.updated_at = now;
                job.claim_token = None;
                true
            }
            None => false,
        })
    }

    async fn find_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.checked()?.jobs.get(&id).cloned())
    }

    async fn delete_queued(&self, id: JobId) -> StoreResult<bool> {
        let mut inner = self.checked()?;
        let queued = inner
            .jobs
            .get(&id)
            .is_some_and(|j| j.status_id == JobStatus::Queued.id());
        if queued {
            inner.jobs.remove(&id);
        }
        Ok(queued)
    }

    async fn recover_stalled(&self, stalled_before: Timestamp, now: Timestamp) -> StoreResult<Vec<Job>> {
        let mut inner = self.checked()?;
        let mut recovered = Vec::new();
        for job in inner.jobs.values_mut() {
            let stalled = job.status_id == JobStatus::Running.id()
                && job.heartbeat_at.is_some_and(|h| h < stalled_before);
            if !stalled {
                continue;
            }
            if job.attempts >= job.max_attempts {
                job.status_id = JobStatus::DeadLettered.id();
                job.completed_at = Some(now);
            } else {
                job.status_id = JobStatus::Queued.id();
                job.completed_at = None;
            }
            job.last_error = Some("worker stopped sending heartbeats".to_string());
            job.error_code = Some(STALLED_ERROR_CODE.to_string());
            job.available_at = now;
            job.updated_at = now;
            job.claim_token = None;
            job.claimed_at = None;
            job.heartbeat_at = None;
            recovered.push(job.clone());
        }
        Ok(recovered)
    }

    async fn count_by_status(&self) -> StoreResult<Vec<StatusCount>> {
        let inner = self.checked()?;
        let mut counts: BTreeMap<i16, i64> = BTreeMap::new();
        for job in inner.jobs.values() {
            *counts.entry(job.status_id).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(status_id, count)| StatusCount { status_id, count })
            .collect())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_pool_if_absent(&self, pool: &NewTokenPool, now: Timestamp) -> StoreResult<TokenPool> {
        let mut inner = self.checked()?;
        if let Some(existing) = inner.pools.get(&pool.day_key) {
            return Ok(existing.clone());
        }
        let row = TokenPool {
            id: inner.next_id(),
            day_key: pool.day_key,
            free_tokens: pool.free_tokens,
            paid_tokens: pool.paid_tokens,
            total_tokens: pool.free_tokens + pool.paid_tokens,
            contribution_total: pool.contribution_total,
            rotated_amount: 0,
            rotated_at: None,
            created_at: now,
        };
        inner.pools.insert(row.day_key, row.clone());
        Ok(row)
    }

    async fn find_pool(&self, day: DayKey) -> StoreResult<Option<TokenPool>> {
        Ok(self.checked()?.pools.get(&day).cloned())
    }

    async fn upsert_allocation(&self, grant: &AllocationGrant, now: Timestamp) -> StoreResult<UserAllocation> {
        let mut inner = self.checked()?;
        let key = (grant.day_key, grant.user_id);
        if let Some(row) = inner.allocations.get_mut(&key) {
            row.tier = grant.tier;
            row.free_granted = grant.free_granted.max(row.free_used);
            row.paid_granted = (grant.paid_granted + row.rotation_bonus).max(row.paid_used);
            row.total_granted = row.free_granted + row.paid_granted;
            row.is_active = true;
            row.updated_at = now;
            return Ok(row.clone());
        }
        let row = UserAllocation {
            id: inner.next_id(),
            user_id: grant.user_id,
            day_key: grant.day_key,
            tier: grant.tier,
            free_granted: grant.free_granted,
            paid_granted: grant.paid_granted,
            free_used: 0,
            paid_used: 0,
            total_granted: grant.free_granted + grant.paid_granted,
            total_used: 0,
            rotation_bonus: 0,
            is_active: true,
            updated_at: now,
        };
        inner.allocations.insert(key, row.clone());
        Ok(row)
    }

    async fn deactivate_inactive_allocations(&self, day: DayKey, now: Timestamp) -> StoreResult<u64> {
        let mut guard = self.checked()?;
        let inner = &mut *guard;
        let mut changed = 0;
        for ((row_day, user_id), row) in inner.allocations.iter_mut() {
            let user_inactive = inner.users.get(user_id).is_some_and(|u| !u.is_active);
            if *row_day == day && row.is_active && user_inactive {
                row.is_active = false;
                row.updated_at = now;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn find_allocation(&self, user_id: UserId, day: DayKey) -> StoreResult<Option<UserAllocation>> {
        Ok(self.checked()?.allocations.get(&(day, user_id)).cloned())
    }

    async fn list_allocations(&self, day: DayKey) -> StoreResult<Vec<UserAllocation>> {
        Ok(self
            .checked()?
            .allocations
            .range((day, UserId::MIN)..=(day, UserId::MAX))
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn try_reserve(
        &self,
        user_id: UserId,
        day: DayKey,
        amount: i64,
        now: Timestamp,
    ) -> StoreResult<Option<UserAllocation>> {
        let mut guard = self.checked()?;
        let inner = &mut *guard;
        let user_active = inner.users.get(&user_id).is_some_and(|u| u.is_active);
        let Some(row) = inner.allocations.get_mut(&(day, user_id)) else {
            return Ok(None);
        };
        if !user_active || !row.is_active || row.total_used + amount > row.total_granted {
            return Ok(None);
        }
        let free_delta = amount.min(row.free_granted - row.free_used);
        let paid_delta = amount - free_delta;
        if paid_delta > row.paid_granted - row.paid_used {
            return Ok(None);
        }
        row.free_used += free_delta;
        row.paid_used += paid_delta;
        row.total_used += amount;
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn try_release(
        &self,
        user_id: UserId,
        day: DayKey,
        amount: i64,
        now: Timestamp,
    ) -> StoreResult<Option<UserAllocation>> {
        let mut inner = self.checked()?;
        let Some(row) = inner.allocations.get_mut(&(day, user_id)) else {
            return Ok(None);
        };
        if row.total_used < amount {
            return Ok(None);
        }
        let paid_delta = amount.min(row.paid_used);
        row.paid_used -= paid_delta;
        row.free_used -= amount - paid_delta;
        row.total_used -= amount;
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn apply_rotation(
        &self,
        day: DayKey,
        grants: &[RotationGrant],
        now: Timestamp,
    ) -> StoreResult<bool> {
        let mut guard = self.checked()?;
        let inner = &mut *guard;
        let planned: i64 = grants.iter().map(|g| g.amount).sum();

        let Some(pool) = inner.pools.get_mut(&day) else {
            return Ok(false);
        };
        if pool.is_rotated() || pool.free_tokens < planned {
            return Ok(false);
        }

        let mut credited = 0;
        for grant in grants {
            if let Some(row) = inner.allocations.get_mut(&(day, grant.user_id)) {
                if row.is_active && row.paid_granted + grant.amount <= grant.cap {
                    row.paid_granted += grant.amount;
                    row.total_granted += grant.amount;
                    row.rotation_bonus += grant.amount;
                    row.updated_at = now;
                    credited += grant.amount;
                }
            }
        }

        pool.rotated_at = Some(now);
        pool.rotated_amount = credited;
        pool.free_tokens -= credited;
        pool.paid_tokens += credited;
        Ok(true)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(self.checked()?.users.get(&id).cloned())
    }

    async fn list_active_users(&self) -> StoreResult<Vec<User>> {
        Ok(self
            .checked()?
            .users
            .values()
            .filter(|u| u.is_active)
            .cloned()
            .collect())
    }
}
