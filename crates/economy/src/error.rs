use chorus_db::StoreError;
use chorus_provider::ProviderError;

/// Errors from the token economy. Denials are not errors; see
/// [`Reservation`](crate::engine::Reservation).
#[derive(Debug, thiserror::Error)]
pub enum EconomyError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Contribution source error: {0}")]
    Contribution(#[from] ProviderError),
}

impl EconomyError {
    /// Whether the caller may retry the same call. Every economy mutation is
    /// idempotent or a single conditional update, so a transient store or
    /// feed failure is always safe to retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            EconomyError::Validation(_) => false,
            EconomyError::Store(e) => e.is_retryable(),
            EconomyError::Contribution(e) => e.is_retryable(),
        }
    }
}
