//! Generation request payload and time estimation.
//!
//! The queue treats payloads as opaque JSON; this module is what the
//! admission layer uses to validate a request and to derive the estimated
//! generation time reported to callers and used as the provider timeout.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Shortest clip the provider accepts, in seconds.
pub const MIN_DURATION_SECS: u32 = 5;

/// Longest clip the provider accepts, in seconds.
pub const MAX_DURATION_SECS: u32 = 300;

/// Clip length used when the caller does not ask for one.
pub const DEFAULT_DURATION_SECS: u32 = 30;

// ---------------------------------------------------------------------------
// Estimation constants
// ---------------------------------------------------------------------------

/// Fixed provider overhead per request (queueing, model warm-up).
pub const ESTIMATE_OVERHEAD_SECS: u32 = 20;

/// Provider seconds spent per second of generated audio.
pub const ESTIMATE_SECS_PER_AUDIO_SEC: u32 = 2;

/// Provider timeout is this multiple of the estimate.
pub const TIMEOUT_ESTIMATE_MULTIPLIER: u32 = 3;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A caller's generation request.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GenerationRequest {
    #[validate(length(min = 1, max = 2000))]
    pub prompt: String,

    #[validate(length(max = 100))]
    pub style: Option<String>,

    #[validate(range(min = 5, max = 300))]
    pub duration_secs: Option<u32>,

    #[serde(default)]
    pub instrumental: bool,

    /// Provider-specific options passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            style: None,
            duration_secs: None,
            instrumental: false,
            extra: None,
        }
    }

    pub fn with_duration(mut self, secs: u32) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    /// Requested clip length, falling back to the default.
    pub fn duration(&self) -> u32 {
        self.duration_secs.unwrap_or(DEFAULT_DURATION_SECS)
    }

    /// Validate the request and serialize it into the job payload.
    pub fn into_payload(self) -> Result<serde_json::Value, CoreError> {
        self.validate()?;
        if self.prompt.trim().is_empty() {
            return Err(CoreError::Validation("Prompt must not be blank".to_string()));
        }
        serde_json::to_value(&self).map_err(|e| CoreError::Internal(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Estimation
// ---------------------------------------------------------------------------

/// Estimated provider time for a clip of `duration_secs` seconds.
pub fn estimate_generation_secs(duration_secs: u32) -> u32 {
    ESTIMATE_OVERHEAD_SECS + duration_secs.saturating_mul(ESTIMATE_SECS_PER_AUDIO_SEC)
}

/// Provider call timeout derived from an estimate, never below `floor`.
pub fn provider_timeout(estimated_secs: u32, floor: Duration) -> Duration {
    let derived =
        Duration::from_secs(u64::from(estimated_secs) * u64::from(TIMEOUT_ESTIMATE_MULTIPLIER));
    derived.max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_scales_with_duration() {
        assert_eq!(estimate_generation_secs(30), 80);
        assert_eq!(estimate_generation_secs(0), ESTIMATE_OVERHEAD_SECS);
    }

    #[test]
    fn timeout_respects_floor() {
        assert_eq!(
            provider_timeout(10, Duration::from_secs(60)),
            Duration::from_secs(60)
        );
        assert_eq!(
            provider_timeout(80, Duration::from_secs(60)),
            Duration::from_secs(240)
        );
    }

    #[test]
    fn default_duration_used_when_absent() {
        let req = GenerationRequest::new("lofi beat");
        assert_eq!(req.duration(), DEFAULT_DURATION_SECS);
    }

    #[test]
    fn valid_request_serializes() {
        let payload = GenerationRequest::new("ambient pads")
            .with_style("ambient")
            .with_duration(60)
            .into_payload()
            .unwrap();
        assert_eq!(payload["prompt"], "ambient pads");
        assert_eq!(payload["duration_secs"], 60);
        assert!(payload.get("extra").is_none());
    }

    #[test]
    fn empty_prompt_rejected() {
        assert!(GenerationRequest::new("").into_payload().is_err());
    }

    #[test]
    fn blank_prompt_rejected() {
        assert!(GenerationRequest::new("   ").into_payload().is_err());
    }

    #[test]
    fn duration_out_of_range_rejected() {
        let req = GenerationRequest::new("x").with_duration(MAX_DURATION_SECS + 1);
        assert!(req.into_payload().is_err());
        let req = GenerationRequest::new("x").with_duration(MIN_DURATION_SECS - 1);
        assert!(req.into_payload().is_err());
    }
}
