//! Repository for the `token_pools` table.

use chorus_core::day_key::DayKey;
use chorus_core::types::Timestamp;
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::token::{NewTokenPool, TokenPool};

/// Column list for `token_pools` queries.
const COLUMNS: &str = "\
    id, day_key, free_tokens, paid_tokens, total_tokens, contribution_total, \
    rotated_amount, rotated_at, created_at";

/// Provides idempotent creation and rotation bookkeeping for daily pools.
pub struct TokenPoolRepo;

impl TokenPoolRepo {
    /// Insert the day's pool unless it already exists, then read it back.
    ///
    /// `ON CONFLICT DO NOTHING` on `uq_token_pools_day_key` makes concurrent
    /// first calls safe: the loser inserts nothing and reads the winner's row.
    pub async fn insert_if_absent(
        pool: &PgPool,
        input: &NewTokenPool,
        now: Timestamp,
    ) -> Result<TokenPool, sqlx::Error> {
        sqlx::query(
            "INSERT INTO token_pools \
                 (day_key, free_tokens, paid_tokens, total_tokens, contribution_total, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (day_key) DO NOTHING",
        )
        .bind(input.day_key.date())
        .bind(input.free_tokens)
        .bind(input.paid_tokens)
        .bind(input.free_tokens + input.paid_tokens)
        .bind(input.contribution_total)
        .bind(now)
        .execute(pool)
        .await?;

        Self::find_by_day(pool, input.day_key)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Find the pool for a day key.
    pub async fn find_by_day(pool: &PgPool, day: DayKey) -> Result<Option<TokenPool>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM token_pools WHERE day_key = $1");
        sqlx::query_as::<_, TokenPool>(&query)
            .bind(day.date())
            .fetch_optional(pool)
            .await
    }

    /// Claim the day's rotation inside `tx`, moving `amount` tokens from
    /// free to paid capacity.
    ///
    /// Returns `false` if the pool does not exist, was already rotated, or
    /// has less than `amount` free capacity.
    pub async fn mark_rotated(
        tx: &mut Transaction<'_, Postgres>,
        day: DayKey,
        amount: i64,
        now: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE token_pools \
             SET rotated_at = $2, rotated_amount = $3, \
                 free_tokens = free_tokens - $3, paid_tokens = paid_tokens + $3 \
             WHERE day_key = $1 AND rotated_at IS NULL AND free_tokens >= $3",
        )
        .bind(day.date())
        .bind(now)
        .bind(amount)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Give back rotated capacity that could not be credited to any user.
    pub async fn return_rotation_shortfall(
        tx: &mut Transaction<'_, Postgres>,
        day: DayKey,
        shortfall: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE token_pools \
             SET rotated_amount = rotated_amount - $2, \
                 free_tokens = free_tokens + $2, paid_tokens = paid_tokens - $2 \
             WHERE day_key = $1",
        )
        .bind(day.date())
        .bind(shortfall)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
