//! Repository for the `user_allocations` table.
//!
//! Consumption columns are only ever changed by [`AllocationRepo::reserve`]
//! and [`AllocationRepo::release`], each a single conditional `UPDATE`.
//! Postgres evaluates every `SET` expression against the pre-update row, so
//! the free/paid split is computed from the same snapshot the `WHERE`
//! clause checked.

use chorus_core::day_key::DayKey;
use chorus_core::types::{Timestamp, UserId};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::token::{AllocationGrant, RotationGrant, UserAllocation};

/// Column list for `user_allocations` queries.
const COLUMNS: &str = "\
    id, user_id, day_key, tier_id, free_granted, paid_granted, free_used, paid_used, \
    total_granted, total_used, rotation_bonus, is_active, updated_at";

/// Provides grant upserts and atomic consumption for daily allocations.
pub struct AllocationRepo;

impl AllocationRepo {
    /// Upsert the granted columns for a (user, day) pair.
    ///
    /// Used columns are never reset. Grants are floored at what is already
    /// used so a re-run with a lower tier cannot break conservation. A
    /// rotation bonus already credited stays on top of the new paid grant.
    pub async fn upsert_grant(
        pool: &PgPool,
        grant: &AllocationGrant,
        now: Timestamp,
    ) -> Result<UserAllocation, sqlx::Error> {
        let query = format!(
            "INSERT INTO user_allocations AS a \
                 (user_id, day_key, tier_id, free_granted, paid_granted, total_granted, \
                  is_active, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $4 + $5, true, $6) \
             ON CONFLICT (user_id, day_key) DO UPDATE SET \
                 tier_id = EXCLUDED.tier_id, \
                 free_granted = GREATEST(EXCLUDED.free_granted, a.free_used), \
                 paid_granted = GREATEST(EXCLUDED.paid_granted + a.rotation_bonus, a.paid_used), \
                 total_granted = GREATEST(EXCLUDED.free_granted, a.free_used) \
                               + GREATEST(EXCLUDED.paid_granted + a.rotation_bonus, a.paid_used), \
                 is_active = true, \
                 updated_at = EXCLUDED.updated_at \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, UserAllocation>(&query)
            .bind(grant.user_id)
            .bind(grant.day_key.date())
            .bind(grant.tier.id())
            .bind(grant.free_granted)
            .bind(grant.paid_granted)
            .bind(now)
            .fetch_one(pool)
            .await
    }

    /// Deactivate the day's allocations belonging to inactive users.
    pub async fn deactivate_for_inactive_users(
        pool: &PgPool,
        day: DayKey,
        now: Timestamp,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE user_allocations a SET is_active = false, updated_at = $2 \
             FROM users u \
             WHERE a.user_id = u.id AND a.day_key = $1 AND a.is_active AND NOT u.is_active",
        )
        .bind(day.date())
        .bind(now)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Find one user's allocation for a day.
    pub async fn find(
        pool: &PgPool,
        user_id: UserId,
        day: DayKey,
    ) -> Result<Option<UserAllocation>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM user_allocations WHERE user_id = $1 AND day_key = $2"
        );
        sqlx::query_as::<_, UserAllocation>(&query)
            .bind(user_id)
            .bind(day.date())
            .fetch_optional(pool)
            .await
    }

    /// List every allocation for a day, ordered by user id.
    pub async fn list_by_day(pool: &PgPool, day: DayKey) -> Result<Vec<UserAllocation>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM user_allocations WHERE day_key = $1 ORDER BY user_id"
        );
        sqlx::query_as::<_, UserAllocation>(&query)
            .bind(day.date())
            .fetch_all(pool)
            .await
    }

    /// Debit `amount` tokens, free before paid, in one conditional update.
    ///
    /// Returns `None` without touching the row when the user or allocation
    /// is inactive or the allocation cannot cover `amount`.
    pub async fn reserve(
        pool: &PgPool,
        user_id: UserId,
        day: DayKey,
        amount: i64,
        now: Timestamp,
    ) -> Result<Option<UserAllocation>, sqlx::Error> {
        let query = format!(
            "UPDATE user_allocations a \
             SET free_used = a.free_used + LEAST($3, a.free_granted - a.free_used), \
                 paid_used = a.paid_used + ($3 - LEAST($3, a.free_granted - a.free_used)), \
                 total_used = a.total_used + $3, \
                 updated_at = $4 \
             FROM users u \
             WHERE a.user_id = $1 AND a.day_key = $2 \
               AND u.id = a.user_id AND u.is_active AND a.is_active \
               AND a.total_used + $3 <= a.total_granted \
               AND $3 - LEAST($3, a.free_granted - a.free_used) <= a.paid_granted - a.paid_used \
             RETURNING {}",
            qualified_columns("a")
        );
        sqlx::query_as::<_, UserAllocation>(&query)
            .bind(user_id)
            .bind(day.date())
            .bind(amount)
            .bind(now)
            .fetch_optional(pool)
            .await
    }

    /// Credit back `amount` reserved tokens, paid before free.
    pub async fn release(
        pool: &PgPool,
        user_id: UserId,
        day: DayKey,
        amount: i64,
        now: Timestamp,
    ) -> Result<Option<UserAllocation>, sqlx::Error> {
        let query = format!(
            "UPDATE user_allocations \
             SET paid_used = paid_used - LEAST($3, paid_used), \
                 free_used = free_used - ($3 - LEAST($3, paid_used)), \
                 total_used = total_used - $3, \
                 updated_at = $4 \
             WHERE user_id = $1 AND day_key = $2 AND total_used >= $3 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, UserAllocation>(&query)
            .bind(user_id)
            .bind(day.date())
            .bind(amount)
            .bind(now)
            .fetch_optional(pool)
            .await
    }

    /// Credit rotated tokens to one paid allocation inside `tx`.
    ///
    /// Conditional on the cap, so `paid_granted` never exceeds it even if a
    /// concurrent allocation pass changed the grant since it was read.
    pub async fn credit_rotation(
        tx: &mut Transaction<'_, Postgres>,
        day: DayKey,
        grant: &RotationGrant,
        now: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE user_allocations \
             SET paid_granted = paid_granted + $3, \
                 total_granted = total_granted + $3, \
                 rotation_bonus = rotation_bonus + $3, \
                 updated_at = $5 \
             WHERE user_id = $1 AND day_key = $2 AND is_active \
               AND paid_granted + $3 <= $4",
        )
        .bind(grant.user_id)
        .bind(day.date())
        .bind(grant.amount)
        .bind(grant.cap)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// `COLUMNS` prefixed with a table alias, for `UPDATE ... FROM` statements
/// where bare names would be ambiguous.
fn qualified_columns(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
