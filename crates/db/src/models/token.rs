//! Token pool and per-user allocation entities.

use chorus_core::day_key::DayKey;
use chorus_core::tiers::Tier;
use chorus_core::types::{DbId, Timestamp, UserId};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `token_pools` table. One per day key.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct TokenPool {
    pub id: DbId,
    #[sqlx(try_from = "chrono::NaiveDate")]
    pub day_key: DayKey,
    pub free_tokens: i64,
    pub paid_tokens: i64,
    pub total_tokens: i64,
    pub contribution_total: i64,
    /// Tokens moved from free to paid capacity by the rotation event.
    pub rotated_amount: i64,
    /// `None` until the day's rotation has run.
    pub rotated_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl TokenPool {
    pub fn is_rotated(&self) -> bool {
        self.rotated_at.is_some()
    }
}

/// Input for creating a day's pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTokenPool {
    pub day_key: DayKey,
    pub free_tokens: i64,
    pub paid_tokens: i64,
    pub contribution_total: i64,
}

/// A row from the `user_allocations` table. One per user per day key.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct UserAllocation {
    pub id: DbId,
    pub user_id: UserId,
    #[sqlx(try_from = "chrono::NaiveDate")]
    pub day_key: DayKey,
    #[sqlx(rename = "tier_id", try_from = "i16")]
    pub tier: Tier,
    pub free_granted: i64,
    pub paid_granted: i64,
    pub free_used: i64,
    pub paid_used: i64,
    pub total_granted: i64,
    pub total_used: i64,
    /// Part of `paid_granted` that came from rotation.
    pub rotation_bonus: i64,
    pub is_active: bool,
    pub updated_at: Timestamp,
}

impl UserAllocation {
    pub fn free_remaining(&self) -> i64 {
        self.free_granted - self.free_used
    }

    pub fn paid_remaining(&self) -> i64 {
        self.paid_granted - self.paid_used
    }

    pub fn remaining(&self) -> i64 {
        self.total_granted - self.total_used
    }

    /// `free_used <= free_granted`, `paid_used <= paid_granted` and
    /// `total_used = free_used + paid_used <= total_granted`.
    pub fn is_conserved(&self) -> bool {
        self.free_used >= 0
            && self.paid_used >= 0
            && self.free_used <= self.free_granted
            && self.paid_used <= self.paid_granted
            && self.total_used == self.free_used + self.paid_used
            && self.total_granted == self.free_granted + self.paid_granted
            && self.total_used <= self.total_granted
    }
}

/// Granted columns written by the daily allocation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationGrant {
    pub user_id: UserId,
    pub day_key: DayKey,
    pub tier: Tier,
    pub free_granted: i64,
    pub paid_granted: i64,
}

/// Rotated tokens credited to one paid allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationGrant {
    pub user_id: UserId,
    pub amount: i64,
    /// `paid_granted` may not exceed this after the credit.
    pub cap: i64,
}
