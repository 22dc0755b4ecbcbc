//! Provider Adapter Contract
//!
//! Trait definitions for AI generation providers. Each adapter normalizes a
//! backend's request/response shape into one uniform streaming contract:
//! submit a prompt, receive a lazy sequence of deltas, end with a usage
//! summary. Backend-specific error mapping lives inside each adapter.
//!
//! # Design Philosophy
//!
//! Adapters are restartable per call: every `start` produces a fresh delta
//! channel with no shared mutable state across invocations. Errors cross the
//! adapter boundary only in classified form so the orchestrator can decide
//! retry vs. fail-fast without knowing which backend it is talking to.
//! Cancellation is cooperative: adapters watch the provided token between
//! deltas and emit a `Cancelled` terminal marker rather than an error.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::messages::{MessageRole, TokenUsage};

/// The closed set of supported provider families
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions (OpenAI, most proxies)
    #[serde(rename = "openai")]
    OpenAi,
    /// Anthropic messages API
    Anthropic,
    /// Local Ollama server
    Ollama,
}

impl ProviderKind {
    /// Human-readable provider name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Sampling parameters for a generation
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Temperature (0.0-1.0)
    pub temperature: f32,
    /// Maximum completion tokens (0 = provider default)
    pub max_tokens: u32,
    /// Nucleus sampling cutoff
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 0,
            top_p: None,
        }
    }
}

/// One turn of conversation history sent to a provider
#[derive(Clone, Debug)]
pub struct PromptMessage {
    /// Who said it
    pub role: MessageRole,
    /// Flattened text content
    pub text: String,
}

/// Everything an adapter needs to start one generation
#[derive(Clone, Debug)]
pub struct PromptContext {
    /// Conversation history, oldest first, ending with the new user message
    pub messages: Vec<PromptMessage>,
    /// Model identifier (provider-specific)
    pub model: String,
    /// Sampling parameters
    pub params: GenerationParams,
    /// Optional system prompt
    pub system: Option<String>,
}

/// One incremental unit of provider output
#[derive(Clone, Debug)]
pub enum Delta {
    /// A text fragment of the response
    Text(String),
    /// A tool-call fragment (id/name on the first fragment, argument
    /// fragments thereafter)
    ToolCall {
        /// Provider-assigned call id
        id: String,
        /// Tool name
        name: String,
        /// Argument JSON fragment
        arguments: String,
    },
    /// A reasoning/thinking fragment
    Reasoning(String),
    /// Final usage summary, sent before `Done` on natural completion
    Usage(TokenUsage),
    /// Stream ended normally
    Done,
    /// Stream stopped because cancellation was requested
    Cancelled,
    /// Stream failed with a classified error
    Failed(ProviderError),
}

/// Classified provider errors
///
/// Raw backend failures never leave an adapter; they are mapped into one of
/// these categories at the boundary.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The backend rejected the request due to rate limiting
    #[error("provider rate limited the request")]
    RateLimited,
    /// Authentication with the backend failed
    #[error("provider authentication failed")]
    AuthFailed,
    /// The prompt exceeds the model's context window
    #[error("prompt exceeds the model context window")]
    ContextTooLong,
    /// A transient network failure (connect error, timeout, reset)
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    /// Anything the adapter could not classify
    #[error("provider error: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// Whether establishing the request may be retried
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}

/// Bounded retry policy for establishing a provider request
///
/// Applies only to `TransientNetwork` failures before any delta has been
/// produced; a stream that fails mid-flight is never silently restarted.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Additional attempts after the first (0 = no retry)
    pub retries: u32,
    /// Base delay, doubled per attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry attempt (0-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Provider Adapter trait
///
/// Implement this to add a provider family. One adapter instance serves many
/// concurrent generations; per-generation state lives in the spawned stream
/// task, never on `self`.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which provider family this adapter speaks for
    fn kind(&self) -> ProviderKind;

    /// Start one generation
    ///
    /// Returns a channel receiver producing deltas as they arrive. The
    /// sequence always terminates with exactly one of `Done`, `Cancelled`,
    /// or `Failed`; after cancellation is requested the adapter stops
    /// producing within a bounded grace period rather than blocking on the
    /// backend indefinitely.
    async fn start(
        &self,
        ctx: &PromptContext,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Delta>, ProviderError>;
}

/// Map an HTTP status and body into a classified error
///
/// Shared by the HTTP-based adapters; body text is only inspected for
/// context-length hints on ambiguous 4xx responses.
#[must_use]
pub fn classify_status(status: reqwest::StatusCode, body: &str) -> ProviderError {
    match status.as_u16() {
        429 => ProviderError::RateLimited,
        401 | 403 => ProviderError::AuthFailed,
        400 | 413 => {
            let lower = body.to_lowercase();
            if lower.contains("context") && (lower.contains("length") || lower.contains("long"))
                || lower.contains("maximum context")
                || lower.contains("too many tokens")
            {
                ProviderError::ContextTooLong
            } else {
                ProviderError::Unknown(format!("{status}: {body}"))
            }
        }
        500..=599 => ProviderError::TransientNetwork(format!("{status}: {body}")),
        _ => ProviderError::Unknown(format!("{status}: {body}")),
    }
}

/// Map a reqwest transport failure into a classified error
#[must_use]
pub fn classify_transport(err: &reqwest::Error) -> ProviderError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        ProviderError::TransientNetwork(err.to_string())
    } else {
        ProviderError::Unknown(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        let classify = |code: u16, body: &str| {
            classify_status(reqwest::StatusCode::from_u16(code).unwrap(), body)
        };
        assert_eq!(classify(429, ""), ProviderError::RateLimited);
        assert_eq!(classify(401, ""), ProviderError::AuthFailed);
        assert_eq!(classify(403, ""), ProviderError::AuthFailed);
        assert_eq!(
            classify(400, "This model's maximum context length is 8192 tokens"),
            ProviderError::ContextTooLong
        );
        assert!(matches!(
            classify(400, "invalid request"),
            ProviderError::Unknown(_)
        ));
        assert!(matches!(
            classify(503, "overloaded"),
            ProviderError::TransientNetwork(_)
        ));
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ProviderError::TransientNetwork("reset".to_string()).is_transient());
        assert!(!ProviderError::RateLimited.is_transient());
        assert!(!ProviderError::AuthFailed.is_transient());
        assert!(!ProviderError::ContextTooLong.is_transient());
    }

    #[test]
    fn test_provider_kind_serde() {
        let json = serde_json::to_value(ProviderKind::OpenAi).unwrap();
        assert_eq!(json, "openai");
        let kind: ProviderKind = serde_json::from_value(serde_json::json!("anthropic")).unwrap();
        assert_eq!(kind, ProviderKind::Anthropic);
    }
}
