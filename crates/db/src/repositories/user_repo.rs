//! Repository for the `users` table.
//!
//! Users belong to the account system; the broker reads them and only
//! writes here from tests and seeding tools.

use chorus_core::tiers::Tier;
use chorus_core::types::UserId;
use sqlx::PgPool;

use crate::models::user::User;

/// Column list for `users` queries.
const COLUMNS: &str = "id, tier_id, is_active, created_at, updated_at";

/// Provides read access and minimal writes for users.
pub struct UserRepo;

impl UserRepo {
    /// Create a user in the given tier.
    pub async fn create(pool: &PgPool, tier: Tier) -> Result<User, sqlx::Error> {
        let query = format!("INSERT INTO users (tier_id) VALUES ($1) RETURNING {COLUMNS}");
        sqlx::query_as::<_, User>(&query)
            .bind(tier.id())
            .fetch_one(pool)
            .await
    }

    /// Find a user by ID, active or not.
    pub async fn find_by_id(pool: &PgPool, id: UserId) -> Result<Option<User>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM users WHERE id = $1");
        sqlx::query_as::<_, User>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List active users ordered by id.
    pub async fn list_active(pool: &PgPool) -> Result<Vec<User>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM users WHERE is_active ORDER BY id");
        sqlx::query_as::<_, User>(&query).fetch_all(pool).await
    }

    /// Soft-delete or restore a user.
    pub async fn set_active(pool: &PgPool, id: UserId, active: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE users SET is_active = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
