//! Provider Registry
//!
//! Maps provider kinds to adapter instances. The orchestrator resolves a
//! session's configured provider through this registry at submit time, so
//! swapping a provider mid-session takes effect on the next generation.

use std::collections::HashMap;
use std::sync::Arc;

use super::traits::{ProviderAdapter, ProviderError, ProviderKind, RetryPolicy};
use super::{AnthropicAdapter, OllamaAdapter, OpenAiAdapter};

/// Registry of available provider adapters
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from environment variables.
    ///
    /// Registers each provider whose credentials are present:
    /// - `OPENAI_API_KEY` (base URL override: `OPENAI_BASE_URL`)
    /// - `ANTHROPIC_API_KEY` (base URL override: `ANTHROPIC_BASE_URL`)
    /// - Ollama is always registered (`OLLAMA_HOST` / `OLLAMA_PORT`)
    ///
    /// # Errors
    ///
    /// Propagates adapter construction failures.
    pub fn from_env(retry: RetryPolicy) -> Result<Self, ProviderError> {
        let mut registry = Self::new();

        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            let base_url = std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| super::openai::DEFAULT_BASE_URL.to_string());
            registry.register(Arc::new(OpenAiAdapter::new(base_url, api_key, retry)?));
        }

        if let Ok(api_key) = std::env::var("ANTHROPIC_API_KEY") {
            let base_url = std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| super::anthropic::DEFAULT_BASE_URL.to_string());
            registry.register(Arc::new(AnthropicAdapter::new(base_url, api_key, retry)?));
        }

        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port: u16 = std::env::var("OLLAMA_PORT")
            .unwrap_or_else(|_| "11434".to_string())
            .parse()
            .unwrap_or(11434);
        registry.register(Arc::new(OllamaAdapter::new(host, port, retry)?));

        Ok(registry)
    }

    /// Register an adapter, replacing any existing one for the same kind
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Look up the adapter for a provider kind
    #[must_use]
    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// List the registered provider kinds
    #[must_use]
    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.adapters.keys().copied().collect()
    }
}
