//! LLM client interface and the HTTP implementation.
//!
//! The pipeline only ever talks to [`LlmClient`]; the gateway layers
//! rate limiting and retries on top of it. [`HttpLlmClient`] speaks an
//! Anthropic-style messages endpoint and maps HTTP outcomes onto the
//! error taxonomy the gateway's retry policy is written against.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default API endpoint base.
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Errors an LLM call can fail with, distinguished so the gateway can
/// decide what to retry.
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    /// Network hiccup or 5xx; safe to retry.
    #[error("transient LLM failure: {0}")]
    Transient(String),

    /// The service rejected the call for rate reasons (HTTP 429).
    #[error("rate limited by LLM service")]
    RateLimited {
        /// Server-suggested wait before retrying, when provided.
        retry_after: Option<Duration>,
    },

    /// The request itself is invalid (4xx other than 429); retrying the
    /// same payload cannot succeed.
    #[error("invalid LLM request: {0}")]
    InvalidRequest(String),

    /// Authentication or authorization failure.
    #[error("LLM authentication failed: {0}")]
    Auth(String),

    /// The call exceeded its deadline.
    #[error("LLM call timed out")]
    Timeout,

    /// The call was abandoned because the run was canceled.
    #[error("LLM call canceled")]
    Canceled,
}

impl LlmError {
    /// Whether the gateway may retry after this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::RateLimited { .. } | Self::Timeout
        )
    }
}

/// One generation request.
#[derive(Debug, Clone)]
pub struct LlmRequest<'a> {
    /// Concrete model name.
    pub model: &'a str,
    /// Fully rendered prompt.
    pub prompt: &'a str,
    /// Output token cap.
    pub max_output_tokens: u32,
    /// Generation temperature.
    pub temperature: f32,
    /// Per-call deadline.
    pub timeout: Duration,
}

/// Client interface the gateway drives.
pub trait LlmClient: Send + Sync {
    /// Sends one generation request and returns the raw model text.
    fn generate<'a>(
        &'a self,
        request: LlmRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String, LlmError>> + Send + 'a>>;
}

/// Messages-API request body.
#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message<'a>>,
}

/// Messages-API request message.
#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

/// Messages-API response content block.
#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

/// Messages-API response body.
#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

/// HTTP client for Anthropic-style messages endpoints.
pub struct HttpLlmClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpLlmClient {
    /// Creates a client for the default endpoint, reading the API key from
    /// `CHRONICLE_API_KEY` or `ANTHROPIC_API_KEY`.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_key = std::env::var("CHRONICLE_API_KEY")
            .or_else(|_| std::env::var("ANTHROPIC_API_KEY"))
            .map_err(|_| {
                LlmError::Auth(
                    "set CHRONICLE_API_KEY or ANTHROPIC_API_KEY".to_string(),
                )
            })?;
        Ok(Self::new(DEFAULT_BASE_URL.to_string(), api_key))
    }

    /// Creates a client against an explicit base URL.
    #[must_use]
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
        }
    }

    /// Maps a non-success HTTP status onto the error taxonomy.
    fn classify_status(
        status: StatusCode,
        retry_after: Option<Duration>,
        body: String,
    ) -> LlmError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::Auth(body),
            StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited { retry_after },
            s if s.is_client_error() => {
                LlmError::InvalidRequest(format!("HTTP {s}: {body}"))
            }
            s => LlmError::Transient(format!("HTTP {s}: {body}")),
        }
    }
}

impl LlmClient for HttpLlmClient {
    fn generate<'a>(
        &'a self,
        request: LlmRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String, LlmError>> + Send + 'a>> {
        Box::pin(async move {
            debug!(
                model = request.model,
                prompt_len = request.prompt.len(),
                max_output_tokens = request.max_output_tokens,
                "sending LLM request"
            );

            let body = MessagesRequest {
                model: request.model,
                max_tokens: request.max_output_tokens,
                temperature: request.temperature,
                messages: vec![Message {
                    role: "user",
                    content: request.prompt,
                }],
            };

            let response = self
                .client
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .header("content-type", "application/json")
                .timeout(request.timeout)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        LlmError::Timeout
                    } else {
                        LlmError::Transient(e.to_string())
                    }
                })?;

            let status = response.status();
            if !status.is_success() {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                let body = response.text().await.unwrap_or_default();
                return Err(Self::classify_status(status, retry_after, body));
            }

            let parsed: MessagesResponse = response
                .json()
                .await
                .map_err(|e| LlmError::Transient(format!("malformed response: {e}")))?;

            parsed
                .content
                .iter()
                .find(|c| c.content_type == "text")
                .map(|c| c.text.clone())
                .ok_or_else(|| {
                    LlmError::InvalidRequest("no text content in response".to_string())
                })
        })
    }
}
