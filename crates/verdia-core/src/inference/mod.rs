//! Outbound call to the generative-inference provider.
//!
//! The provider is an untrusted, best-effort external capability: given the
//! fixed instruction and a normalized image it returns free-form text, and
//! it may fail, stall, or answer garbage. This module bounds the call with
//! timeouts and maps every failure to a distinguishable [`InferenceError`]
//! kind so the server can answer with a 502-class response instead of
//! crashing.
//!
//! Retry policy is an explicit, swappable value at this boundary. The
//! default performs no retries; when enabled, only transport-level failures
//! are retried — a provider that answered (even with an error status) is
//! not called again.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::imaging::NORMALIZED_MIME;
use crate::prompt::PromptPayload;

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Configuration for the inference client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Provider API base URL, without a trailing slash.
    pub api_base: String,

    /// Model identifier, with or without the `models/` prefix.
    pub model: String,

    /// Per-request timeout in seconds. A stalled provider must not be able
    /// to exhaust server concurrency.
    pub request_timeout_secs: u64,

    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

/// Retry strategy applied to transport failures.
///
/// Kept as a plain value so tests and deployments can swap it without
/// touching the client. The default performs no retries: a failed request
/// requires a new client-initiated attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first.
    pub max_retries: u32,
    /// Base backoff in milliseconds, scaled linearly per attempt.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based).
    #[must_use]
    pub const fn backoff_for(self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms * attempt as u64)
    }
}

/// Failures of the external inference call.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// No provider credential is configured. Surfaces as a configuration
    /// fault, never silently bypassed.
    #[error("inference credential is not configured")]
    MissingCredential,

    /// The request could not be delivered or the connection failed.
    #[error("inference transport failure: {0}")]
    Transport(String),

    /// The provider did not answer within the request timeout.
    #[error("inference request timed out")]
    Timeout,

    /// The provider answered with a non-success status.
    #[error("inference provider returned status {status}")]
    Status {
        /// HTTP status code from the provider.
        status: u16,
    },

    /// The provider answered 200 but produced no text output.
    #[error("inference provider returned an empty response")]
    Empty,
}

/// The external model capability: prompt plus image in, raw text out.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Invokes the model. The returned text is untrusted free-form output;
    /// extraction and validation happen downstream.
    async fn infer(&self, payload: &PromptPayload<'_>) -> Result<String, InferenceError>;

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

/// Production provider targeting the Gemini `generateContent` REST API.
pub struct GeminiProvider {
    config: InferenceConfig,
    retry: RetryPolicy,
    api_key: Option<SecretString>,
    http: reqwest::Client,
}

impl GeminiProvider {
    /// Creates a provider. A missing credential is accepted here and
    /// reported per-request, so the service can start (and health-check)
    /// without one.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::Transport`] if the HTTP client cannot be
    /// initialized.
    pub fn new(
        config: InferenceConfig,
        retry: RetryPolicy,
        api_key: Option<SecretString>,
    ) -> Result<Self, InferenceError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| InferenceError::Transport(e.to_string()))?;

        Ok(Self {
            config,
            retry,
            api_key,
            http,
        })
    }

    /// `{base}/models/{model}:generateContent`
    fn endpoint(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        let model = self.config.model.trim();
        let model_path = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        };
        format!("{base}/{model_path}:generateContent")
    }

    /// Request body: the instruction text part followed by the image as an
    /// inline base64 part.
    fn build_request(payload: &PromptPayload<'_>) -> Value {
        json!({
            "contents": [{
                "parts": [
                    { "text": payload.instruction },
                    {
                        "inlineData": {
                            "mimeType": NORMALIZED_MIME,
                            "data": BASE64.encode(&payload.image.bytes),
                        }
                    }
                ]
            }]
        })
    }

    /// Concatenates every text part of every candidate. Returns `None`
    /// when the response carries no text at all.
    fn extract_text(body: &Value) -> Option<String> {
        let candidates = body.get("candidates")?.as_array()?;
        let mut out = String::new();

        for candidate in candidates {
            let Some(parts) = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
            else {
                continue;
            };
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
        }

        if out.trim().is_empty() { None } else { Some(out) }
    }

    async fn send_once(&self, endpoint: &str, key: &str, body: &Value) -> Result<String, InferenceError> {
        let response = self
            .http
            .post(endpoint)
            .query(&[("key", key)])
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout
                } else {
                    InferenceError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "inference provider rejected request");
            return Err(InferenceError::Status {
                status: status.as_u16(),
            });
        }

        let parsed: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout
            } else {
                InferenceError::Transport(e.to_string())
            }
        })?;

        Self::extract_text(&parsed).ok_or(InferenceError::Empty)
    }
}

#[async_trait]
impl InferenceProvider for GeminiProvider {
    async fn infer(&self, payload: &PromptPayload<'_>) -> Result<String, InferenceError> {
        let Some(key) = self.api_key.as_ref() else {
            return Err(InferenceError::MissingCredential);
        };

        let endpoint = self.endpoint();
        let body = Self::build_request(payload);

        let mut attempt = 0;
        loop {
            match self.send_once(&endpoint, key.expose_secret(), &body).await {
                Ok(text) => {
                    debug!(chars = text.len(), "inference response received");
                    return Ok(text);
                },
                // Only transport failures are retryable; the provider
                // never observed a delivered request.
                Err(InferenceError::Transport(reason)) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max = self.retry.max_retries,
                        reason = %reason,
                        "retrying inference after transport failure"
                    );
                    tokio::time::sleep(self.retry.backoff_for(attempt)).await;
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

/// Deterministic provider for tests: returns a canned response or a canned
/// failure without any network access.
pub struct MockInferenceProvider {
    response: Result<String, InferenceErrorKind>,
}

/// Clonable stand-in for [`InferenceError`] used by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceErrorKind {
    /// Maps to [`InferenceError::MissingCredential`].
    MissingCredential,
    /// Maps to [`InferenceError::Transport`].
    Transport,
    /// Maps to [`InferenceError::Timeout`].
    Timeout,
    /// Maps to [`InferenceError::Status`] with the given code.
    Status(u16),
    /// Maps to [`InferenceError::Empty`].
    Empty,
}

impl MockInferenceProvider {
    /// Mock that answers every call with `text`.
    #[must_use]
    pub fn with_response(text: impl Into<String>) -> Self {
        Self {
            response: Ok(text.into()),
        }
    }

    /// Mock that fails every call with the given kind.
    #[must_use]
    pub const fn failing(kind: InferenceErrorKind) -> Self {
        Self {
            response: Err(kind),
        }
    }
}

#[async_trait]
impl InferenceProvider for MockInferenceProvider {
    async fn infer(&self, _payload: &PromptPayload<'_>) -> Result<String, InferenceError> {
        match &self.response {
            Ok(text) => Ok(text.clone()),
            Err(kind) => Err(match kind {
                InferenceErrorKind::MissingCredential => InferenceError::MissingCredential,
                InferenceErrorKind::Transport => {
                    InferenceError::Transport("mock transport failure".into())
                },
                InferenceErrorKind::Timeout => InferenceError::Timeout,
                InferenceErrorKind::Status(status) => InferenceError::Status { status: *status },
                InferenceErrorKind::Empty => InferenceError::Empty,
            }),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use crate::imaging::NormalizedImage;
    use crate::prompt;

    use super::*;

    fn provider(config: InferenceConfig) -> GeminiProvider {
        GeminiProvider::new(config, RetryPolicy::default(), None).unwrap()
    }

    fn image() -> NormalizedImage {
        NormalizedImage {
            bytes: vec![0xFF, 0xD8, 0xFF, 0xD9],
            width: 1,
            height: 1,
        }
    }

    #[test]
    fn endpoint_appends_models_prefix() {
        let p = provider(InferenceConfig::default());
        assert_eq!(
            p.endpoint(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn endpoint_keeps_existing_models_prefix() {
        let p = provider(InferenceConfig {
            api_base: "https://example.test/v1beta/".into(),
            model: "models/custom".into(),
            ..InferenceConfig::default()
        });
        assert_eq!(p.endpoint(), "https://example.test/v1beta/models/custom:generateContent");
    }

    #[test]
    fn request_body_carries_text_then_inline_image() {
        let img = image();
        let payload = prompt::build(&img);
        let body = GeminiProvider::build_request(&payload);

        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[0]["text"].as_str().unwrap().contains("español"));
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(
            parts[1]["inlineData"]["data"].as_str().unwrap(),
            BASE64.encode([0xFF, 0xD8, 0xFF, 0xD9])
        );
    }

    #[test]
    fn extract_text_joins_candidate_parts() {
        let body = json!({
            "candidates": [{
                "content": { "parts": [ { "text": "hola " }, { "text": "mundo" } ] }
            }]
        });
        assert_eq!(GeminiProvider::extract_text(&body), Some("hola mundo".into()));
    }

    #[test]
    fn extract_text_empty_response_is_none() {
        assert_eq!(GeminiProvider::extract_text(&json!({})), None);
        assert_eq!(
            GeminiProvider::extract_text(&json!({ "candidates": [] })),
            None
        );
        let whitespace = json!({
            "candidates": [{ "content": { "parts": [ { "text": "  " } ] } }]
        });
        assert_eq!(GeminiProvider::extract_text(&whitespace), None);
    }

    #[tokio::test]
    async fn missing_credential_fails_before_any_io() {
        let p = provider(InferenceConfig::default());
        let img = image();
        let payload = prompt::build(&img);

        let err = p.infer(&payload).await.unwrap_err();
        assert!(matches!(err, InferenceError::MissingCredential));
    }

    #[test]
    fn default_retry_policy_performs_no_retries() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.max_retries, 0);
    }

    #[test]
    fn backoff_scales_linearly() {
        let retry = RetryPolicy {
            max_retries: 3,
            backoff_ms: 100,
        };
        assert_eq!(retry.backoff_for(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn mock_provider_round_trips() {
        let img = image();
        let payload = prompt::build(&img);

        let ok = MockInferenceProvider::with_response("{}");
        assert_eq!(ok.infer(&payload).await.unwrap(), "{}");

        let err = MockInferenceProvider::failing(InferenceErrorKind::Status(503));
        assert!(matches!(
            err.infer(&payload).await.unwrap_err(),
            InferenceError::Status { status: 503 }
        ));
    }
}
