//! End-of-day redistribution of unused free-tier grants.
//!
//! Planning is pure: it reads one day's allocations and the pool's free
//! capacity and decides who gets what. Applying the plan is the store's job
//! ([`TokenStore::apply_rotation`](chorus_db::TokenStore::apply_rotation)).

use chorus_core::tiers::Tier;
use chorus_db::models::token::{RotationGrant, UserAllocation};

/// Planned rotation for one day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationPlan {
    /// Sum of positive `free_granted - free_used` over free-tier rows.
    pub unused_free: i64,
    /// In distribution order.
    pub grants: Vec<RotationGrant>,
}

impl RotationPlan {
    pub fn distributed(&self) -> i64 {
        self.grants.iter().map(|g| g.amount).sum()
    }
}

/// Distribute `min(unused free-tier tokens, pool_free)` to active paid-tier
/// allocations.
///
/// Recipients are visited by ascending tier rank, then user id. Each is
/// topped up until `paid_granted` reaches the tier's rotation cap; whatever
/// no one has room for stays undistributed.
pub fn plan_rotation(allocations: &[UserAllocation], pool_free: i64) -> RotationPlan {
    let unused_free: i64 = allocations
        .iter()
        .filter(|a| a.tier == Tier::Free)
        .map(|a| (a.free_granted - a.free_used).max(0))
        .sum();

    let mut recipients: Vec<&UserAllocation> = allocations
        .iter()
        .filter(|a| a.is_active && a.tier.is_paid())
        .collect();
    recipients.sort_by_key(|a| (a.tier.limits().rank, a.user_id));

    let mut remaining = unused_free.min(pool_free.max(0));
    let mut grants = Vec::new();
    for allocation in recipients {
        if remaining == 0 {
            break;
        }
        let cap = allocation.tier.limits().rotation_cap;
        let room = cap - allocation.paid_granted;
        if room <= 0 {
            continue;
        }
        let amount = room.min(remaining);
        grants.push(RotationGrant {
            user_id: allocation.user_id,
            amount,
            cap,
        });
        remaining -= amount;
    }

    RotationPlan {
        unused_free,
        grants,
    }
}
