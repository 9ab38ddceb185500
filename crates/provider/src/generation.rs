//! Generation provider seam and its HTTP adapter.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Whatever the provider returned for a finished generation. Stored on the
/// job as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationOutput {
    pub result: serde_json::Value,
}

impl GenerationOutput {
    pub fn new(result: serde_json::Value) -> Self {
        Self { result }
    }
}

/// The external audio generation capability.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Run one generation. Must give up after `timeout`; a timeout is
    /// reported as [`ProviderError::Retryable`].
    async fn generate(
        &self,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<GenerationOutput, ProviderError>;
}

/// HTTP client for a generation provider exposing `POST /generate`.
pub struct HttpGenerationProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
}

impl HttpGenerationProvider {
    /// * `api_url` - Base HTTP URL, e.g. `http://provider:8080`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    /// Send `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Return the response unchanged on 2xx, or a classified error carrying
    /// the status and body text.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ProviderError::from_status(status.as_u16(), &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationProvider {
    async fn generate(
        &self,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<GenerationOutput, ProviderError> {
        let mut request = self
            .client
            .post(format!("{}/generate", self.api_url))
            .timeout(timeout)
            .json(payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = Self::ensure_success(request.send().await?).await?;
        let result = response.json::<serde_json::Value>().await?;
        Ok(GenerationOutput::new(result))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};

    use super::*;
    use crate::test_support::spawn_stub;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn returns_provider_body_on_success() {
        let app = Router::new().route(
            "/generate",
            post(|Json(body): Json<serde_json::Value>| async move {
                Json(serde_json::json!({"clip_url": "https://cdn/clip.mp3", "prompt": body["prompt"]}))
            }),
        );
        let provider = HttpGenerationProvider::new(spawn_stub(app).await);

        let output = provider
            .generate(&serde_json::json!({"prompt": "lofi"}), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(output.result["prompt"], "lofi");
        assert_eq!(output.result["clip_url"], "https://cdn/clip.mp3");
    }

    #[tokio::test]
    async fn sends_bearer_key() {
        let app = Router::new().route(
            "/generate",
            post(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(serde_json::json!({ "auth": auth }))
            }),
        );
        let provider = HttpGenerationProvider::new(spawn_stub(app).await).with_api_key("secret");

        let output = provider.generate(&serde_json::json!({}), TIMEOUT).await.unwrap();
        assert_eq!(output.result["auth"], "Bearer secret");
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let app = Router::new().route(
            "/generate",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
        );
        let provider = HttpGenerationProvider::new(spawn_stub(app).await);

        let err = provider.generate(&serde_json::json!({}), TIMEOUT).await.unwrap_err();
        assert_matches!(err, ProviderError::Retryable(msg) if msg.contains("overloaded"));
    }

    #[tokio::test]
    async fn rejected_request_is_terminal() {
        let app = Router::new().route(
            "/generate",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "prompt violates policy") }),
        );
        let provider = HttpGenerationProvider::new(spawn_stub(app).await);

        let err = provider.generate(&serde_json::json!({}), TIMEOUT).await.unwrap_err();
        assert_matches!(err, ProviderError::Terminal(_));
    }

    #[tokio::test]
    async fn timeout_is_retryable() {
        let app = Router::new().route(
            "/generate",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let provider = HttpGenerationProvider::new(spawn_stub(app).await);

        let err = provider
            .generate(&serde_json::json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_provider_is_retryable() {
        let provider = HttpGenerationProvider::new("http://127.0.0.1:1");
        let err = provider.generate(&serde_json::json!({}), TIMEOUT).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
