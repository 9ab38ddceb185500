//! Users as seen by the broker: tier and soft-delete flag only.

use chorus_core::tiers::Tier;
use chorus_core::types::{Timestamp, UserId};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `users` table.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct User {
    pub id: UserId,
    #[sqlx(rename = "tier_id", try_from = "i16")]
    pub tier: Tier,
    pub is_active: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}
