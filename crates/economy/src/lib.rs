//! Shared daily token economy: pool creation, per-tier allocation, atomic
//! reservation and end-of-day rotation of unused free-tier grants.

pub mod engine;
pub mod error;
pub mod rotation;

pub use engine::{
    pool_capacity, DenialReason, EconomyConfig, Reservation, RotationSummary, TokenEconomy,
    DEFAULT_BASE_FREE_TOKENS, DEFAULT_BASE_PAID_TOKENS,
};
pub use error::EconomyError;
pub use rotation::{plan_rotation, RotationPlan};
