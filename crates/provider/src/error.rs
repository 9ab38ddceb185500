//! Provider error classification.

/// Errors from an external provider call.
///
/// The queue engine retries `Retryable` errors with backoff and moves the
/// job to `Failed` on `Terminal` ones.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Transient: timeouts, connection failures, throttling, 5xx.
    #[error("Retryable provider error: {0}")]
    Retryable(String),

    /// Permanent: the provider rejected the request itself.
    #[error("Terminal provider error: {0}")]
    Terminal(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable(_))
    }

    /// Stable machine-readable code recorded on the job.
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::Retryable(_) => "provider_retryable",
            ProviderError::Terminal(_) => "provider_terminal",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ProviderError::Retryable(m) | ProviderError::Terminal(m) => m,
        }
    }

    /// Build an error from a non-2xx HTTP response.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {status}: {body}");
        if is_retryable_status(status) {
            ProviderError::Retryable(message)
        } else {
            ProviderError::Terminal(message)
        }
    }
}

/// 408, 425, 429 and every 5xx are worth retrying; other statuses are not.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || (500..600).contains(&status)
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() || err.is_decode() {
            ProviderError::Terminal(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::from_status(status.as_u16(), &err.to_string())
        } else {
            // Timeouts, connect and body errors.
            ProviderError::Retryable(err.to_string())
        }
    }
}
