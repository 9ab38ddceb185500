//! Shared primitives for the generation broker.
//!
//! Everything here is pure: no database, no network, no runtime. Both
//! engines and the repository layer depend on it.

pub mod clock;
pub mod day_key;
pub mod error;
pub mod generation;
pub mod scheduling;
pub mod tiers;
pub mod types;
