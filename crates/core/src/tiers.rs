//! Subscription tiers and their token limits.
//!
//! [`TIER_LIMITS`] is the single source of truth for daily grants, rotation
//! caps and rotation order. Engines look limits up through
//! [`Tier::limits`]; no grant size appears anywhere else.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Tier ID type matching SMALLINT in the `users.tier_id` column.
pub type TierId = i16;

/// A user's subscription level.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free = 1,
    Starter = 2,
    Pro = 3,
    Studio = 4,
}

/// Grant and rotation parameters for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub tier: Tier,
    /// Position in rotation order; lower ranks are topped up first.
    pub rank: u8,
    /// Free tokens granted per day.
    pub daily_free: i64,
    /// Paid tokens granted per day.
    pub daily_paid: i64,
    /// Ceiling for `paid_granted` after rotation. Zero means the tier
    /// never receives rotated tokens.
    pub rotation_cap: i64,
}

impl TierLimits {
    pub fn total_daily(&self) -> i64 {
        self.daily_free + self.daily_paid
    }
}

/// Limits for every tier, ordered by rank.
pub static TIER_LIMITS: [TierLimits; 4] = [
    TierLimits {
        tier: Tier::Free,
        rank: 0,
        daily_free: 5,
        daily_paid: 0,
        rotation_cap: 0,
    },
    TierLimits {
        tier: Tier::Starter,
        rank: 1,
        daily_free: 5,
        daily_paid: 10,
        rotation_cap: 20,
    },
    TierLimits {
        tier: Tier::Pro,
        rank: 2,
        daily_free: 10,
        daily_paid: 50,
        rotation_cap: 100,
    },
    TierLimits {
        tier: Tier::Studio,
        rank: 3,
        daily_free: 10,
        daily_paid: 120,
        rotation_cap: 200,
    },
];

impl Tier {
    /// Return the database tier ID.
    pub fn id(self) -> TierId {
        self as TierId
    }

    /// Resolve a database tier ID.
    pub fn from_id(id: TierId) -> Result<Self, CoreError> {
        match id {
            1 => Ok(Tier::Free),
            2 => Ok(Tier::Starter),
            3 => Ok(Tier::Pro),
            4 => Ok(Tier::Studio),
            other => Err(CoreError::Validation(format!("Unknown tier id: {other}"))),
        }
    }

    pub fn limits(self) -> &'static TierLimits {
        &TIER_LIMITS[self as usize - 1]
    }

    /// Paid tiers receive rotated tokens; the free tier donates them.
    pub fn is_paid(self) -> bool {
        self != Tier::Free
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Pro => "pro",
            Tier::Studio => "studio",
        }
    }
}

impl TryFrom<TierId> for Tier {
    type Error = CoreError;

    fn try_from(id: TierId) -> Result<Self, Self::Error> {
        Tier::from_id(id)
    }
}

impl From<Tier> for TierId {
    fn from(value: Tier) -> Self {
        value as TierId
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
