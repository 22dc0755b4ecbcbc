//! Provider Adapters
//!
//! Trait-based abstraction over streaming LLM APIs. Each adapter hides its
//! provider's wire format (SSE, NDJSON) behind a uniform `Delta` stream, so
//! the orchestrator never sees provider-specific payloads.
//!
//! # Design Philosophy
//!
//! Adapters establish the HTTP request themselves (with retry on transient
//! failures), then hand back an `mpsc::Receiver<Delta>` fed by a spawned
//! parser task. Cancellation is cooperative: the token passed to `start`
//! is watched inside the parser task, which drops the connection and emits
//! a final `Delta::Cancelled` when it fires.

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod registry;
pub mod traits;

pub use anthropic::AnthropicAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
pub use registry::ProviderRegistry;
pub use traits::{
    Delta, GenerationParams, PromptContext, PromptMessage, ProviderAdapter, ProviderError,
    ProviderKind, RetryPolicy,
};
