//! Daily contribution input from the analytics component.
//!
//! Contributions grow the day's token pool on top of the configured base
//! amounts. The broker only reads them.

use async_trait::async_trait;
use chorus_core::day_key::DayKey;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Tokens contributed for one day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub free_amount: i64,
    pub paid_amount: i64,
}

impl Contribution {
    pub fn new(free_amount: i64, paid_amount: i64) -> Self {
        Self {
            free_amount,
            paid_amount,
        }
    }

    pub fn total(&self) -> i64 {
        self.free_amount + self.paid_amount
    }
}

/// Source of a day's contribution.
#[async_trait]
pub trait ContributionSource: Send + Sync {
    async fn daily_contribution(&self, day: DayKey) -> Result<Contribution, ProviderError>;
}

/// Same contribution every day. Used when no analytics endpoint is
/// configured (with the zero default) and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedContribution(pub Contribution);

#[async_trait]
impl ContributionSource for FixedContribution {
    async fn daily_contribution(&self, _day: DayKey) -> Result<Contribution, ProviderError> {
        Ok(self.0)
    }
}

/// Reads `GET {api_url}/contributions/{YYYY-MM-DD}`.
pub struct HttpContributionSource {
    client: reqwest::Client,
    api_url: String,
}

impl HttpContributionSource {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ContributionSource for HttpContributionSource {
    async fn daily_contribution(&self, day: DayKey) -> Result<Contribution, ProviderError> {
        let response = self
            .client
            .get(format!("{}/contributions/{day}", self.api_url))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ProviderError::from_status(status.as_u16(), &body));
        }

        let contribution = response.json::<Contribution>().await?;
        if contribution.free_amount < 0 || contribution.paid_amount < 0 {
            return Err(ProviderError::Terminal(format!(
                "negative contribution for {day}: {contribution:?}"
            )));
        }
        tracing::debug!(%day, total = contribution.total(), "Fetched daily contribution");
        Ok(contribution)
    }
}
