//! Adapters for the external services the broker depends on: the audio
//! generation provider and the daily contribution feed.

pub mod contribution;
pub mod error;
pub mod generation;

#[cfg(test)]
mod test_support;

pub use contribution::{Contribution, ContributionSource, FixedContribution, HttpContributionSource};
pub use error::ProviderError;
pub use generation::{GenerationOutput, GenerationProvider, HttpGenerationProvider};
