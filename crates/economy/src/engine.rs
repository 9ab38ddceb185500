//! The token economy engine.
//!
//! Owns the daily pool lifecycle (create, allocate, rotate) and the atomic
//! debit used at admission. All state lives in the [`TokenStore`]; the
//! engine itself is stateless and can be shared via `Arc`.

use std::fmt;
use std::sync::Arc;

use chorus_core::clock::Clock;
use chorus_core::day_key::DayKey;
use chorus_core::types::UserId;
use chorus_db::models::token::{AllocationGrant, NewTokenPool, TokenPool, UserAllocation};
use chorus_db::{TokenStore, UserStore};
use chorus_provider::{Contribution, ContributionSource};
use serde::Serialize;

use crate::error::EconomyError;
use crate::rotation::plan_rotation;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Free capacity every pool starts with before contributions.
pub const DEFAULT_BASE_FREE_TOKENS: i64 = 1_000;

/// Paid capacity every pool starts with before contributions.
pub const DEFAULT_BASE_PAID_TOKENS: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EconomyConfig {
    pub base_free: i64,
    pub base_paid: i64,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            base_free: DEFAULT_BASE_FREE_TOKENS,
            base_paid: DEFAULT_BASE_PAID_TOKENS,
        }
    }
}

/// Pool capacity for a day: contributions are split 70/30 between free and
/// paid capacity, rounding each share down.
pub fn pool_capacity(config: &EconomyConfig, contribution: &Contribution) -> (i64, i64) {
    let total = contribution.total();
    (config.base_free + total * 7 / 10, config.base_paid + total * 3 / 10)
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Why a reservation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    InsufficientTokens,
    UserInactive,
}

impl DenialReason {
    /// Stable code reported to callers.
    pub fn code(self) -> &'static str {
        match self {
            DenialReason::InsufficientTokens => "insufficient_tokens",
            DenialReason::UserInactive => "user_inactive",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of [`TokenEconomy::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Debited; carries the allocation after the debit.
    Granted(UserAllocation),
    Denied(DenialReason),
}

/// Outcome of [`TokenEconomy::rotate_unused`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationSummary {
    pub day_key: DayKey,
    pub unused_free: i64,
    /// Tokens actually credited; zero when `applied` is false.
    pub distributed: i64,
    pub recipients: usize,
    /// False when the day was already rotated or has no pool.
    pub applied: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct TokenEconomy {
    tokens: Arc<dyn TokenStore>,
    users: Arc<dyn UserStore>,
    contributions: Arc<dyn ContributionSource>,
    clock: Arc<dyn Clock>,
    config: EconomyConfig,
}

impl TokenEconomy {
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        users: Arc<dyn UserStore>,
        contributions: Arc<dyn ContributionSource>,
        clock: Arc<dyn Clock>,
        config: EconomyConfig,
    ) -> Self {
        Self {
            tokens,
            users,
            contributions,
            clock,
            config,
        }
    }

    /// Return the day's pool, creating it on first call.
    ///
    /// Concurrent first calls all receive the same row.
    pub async fn ensure_daily_pool(&self, day: DayKey) -> Result<TokenPool, EconomyError> {
        if let Some(pool) = self.tokens.find_pool(day).await? {
            return Ok(pool);
        }

        let contribution = self.contributions.daily_contribution(day).await?;
        let (free_tokens, paid_tokens) = pool_capacity(&self.config, &contribution);
        let input = NewTokenPool {
            day_key: day,
            free_tokens,
            paid_tokens,
            contribution_total: contribution.total(),
        };
        let pool = self
            .tokens
            .insert_pool_if_absent(&input, self.clock.now())
            .await?;

        tracing::info!(
            day_key = %day,
            free_tokens = pool.free_tokens,
            paid_tokens = pool.paid_tokens,
            contribution_total = pool.contribution_total,
            "Daily token pool ready",
        );
        Ok(pool)
    }

    /// Grant every active user their tier's daily tokens for `day`.
    ///
    /// Safe to re-run: granted columns are overwritten, used columns and
    /// rotation bonuses are kept. Allocations of users deactivated since the
    /// last run are marked inactive.
    pub async fn allocate_daily(&self, day: DayKey) -> Result<Vec<UserAllocation>, EconomyError> {
        let now = self.clock.now();
        let users = self.users.list_active_users().await?;

        let mut allocations = Vec::with_capacity(users.len());
        for user in &users {
            let limits = user.tier.limits();
            let grant = AllocationGrant {
                user_id: user.id,
                day_key: day,
                tier: user.tier,
                free_granted: limits.daily_free,
                paid_granted: limits.daily_paid,
            };
            allocations.push(self.tokens.upsert_allocation(&grant, now).await?);
        }

        let deactivated = self.tokens.deactivate_inactive_allocations(day, now).await?;
        tracing::info!(
            day_key = %day,
            allocated = allocations.len(),
            deactivated,
            "Daily allocations granted",
        );
        Ok(allocations)
    }

    /// Atomically debit `amount` tokens from the user's allocation for
    /// `day`, free before paid.
    pub async fn reserve(
        &self,
        user_id: UserId,
        day: DayKey,
        amount: i64,
    ) -> Result<Reservation, EconomyError> {
        if amount <= 0 {
            return Err(EconomyError::Validation(format!(
                "Reservation amount must be positive, got {amount}"
            )));
        }

        if let Some(allocation) = self
            .tokens
            .try_reserve(user_id, day, amount, self.clock.now())
            .await?
        {
            return Ok(Reservation::Granted(allocation));
        }

        let reason = self.denial_reason(user_id, day).await?;
        tracing::debug!(user_id, day_key = %day, amount, reason = reason.code(), "Reservation denied");
        Ok(Reservation::Denied(reason))
    }

    /// Classify a refused debit. Read-only, so it may race with other
    /// writers; an active user with an active row is reported as short of
    /// tokens.
    async fn denial_reason(&self, user_id: UserId, day: DayKey) -> Result<DenialReason, EconomyError> {
        let user_active = self
            .users
            .find_user(user_id)
            .await?
            .is_some_and(|u| u.is_active);
        if !user_active {
            return Ok(DenialReason::UserInactive);
        }
        match self.tokens.find_allocation(user_id, day).await? {
            Some(allocation) if !allocation.is_active => Ok(DenialReason::UserInactive),
            _ => Ok(DenialReason::InsufficientTokens),
        }
    }

    /// Undo a reservation, returning paid tokens before free ones.
    ///
    /// Only for a debit whose job was never created. Failed jobs are not
    /// refunded.
    pub async fn release(
        &self,
        user_id: UserId,
        day: DayKey,
        amount: i64,
    ) -> Result<UserAllocation, EconomyError> {
        if amount <= 0 {
            return Err(EconomyError::Validation(format!(
                "Release amount must be positive, got {amount}"
            )));
        }
        let allocation = self
            .tokens
            .try_release(user_id, day, amount, self.clock.now())
            .await?
            .ok_or_else(|| {
                EconomyError::Validation(format!(
                    "User {user_id} has fewer than {amount} reserved tokens on {day}"
                ))
            })?;
        tracing::info!(user_id, day_key = %day, amount, "Reservation released");
        Ok(allocation)
    }

    /// Redistribute the day's unused free-tier tokens to paid tiers.
    ///
    /// Runs at most once per day; later calls report `applied: false`.
    pub async fn rotate_unused(&self, day: DayKey) -> Result<RotationSummary, EconomyError> {
        let skipped = |unused_free| RotationSummary {
            day_key: day,
            unused_free,
            distributed: 0,
            recipients: 0,
            applied: false,
        };

        let Some(pool) = self.tokens.find_pool(day).await? else {
            tracing::warn!(day_key = %day, "No token pool for day, skipping rotation");
            return Ok(skipped(0));
        };
        if pool.is_rotated() {
            tracing::debug!(day_key = %day, "Day already rotated");
            return Ok(skipped(0));
        }

        let allocations = self.tokens.list_allocations(day).await?;
        let plan = plan_rotation(&allocations, pool.free_tokens);
        let applied = self
            .tokens
            .apply_rotation(day, &plan.grants, self.clock.now())
            .await?;
        if !applied {
            tracing::info!(day_key = %day, "Rotation already claimed by another caller");
            return Ok(skipped(plan.unused_free));
        }

        let distributed = match self.tokens.find_pool(day).await? {
            Some(pool) => pool.rotated_amount,
            None => plan.distributed(),
        };
        let summary = RotationSummary {
            day_key: day,
            unused_free: plan.unused_free,
            distributed,
            recipients: plan.grants.len(),
            applied: true,
        };
        tracing::info!(
            day_key = %day,
            unused_free = summary.unused_free,
            distributed = summary.distributed,
            recipients = summary.recipients,
            "Unused free-tier tokens rotated",
        );
        Ok(summary)
    }

    /// The user's allocation for `day`, if one was granted.
    pub async fn balance(&self, user_id: UserId, day: DayKey) -> Result<Option<UserAllocation>, EconomyError> {
        Ok(self.tokens.find_allocation(user_id, day).await?)
    }
}
