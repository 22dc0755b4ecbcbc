//! Persistence and Settings Collaborators
//!
//! The orchestrator talks to storage and settings through traits so the
//! generation pipeline stays independent of any particular database. The
//! in-memory implementations here back the test suite and small deployments.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::messages::{Message, MessageId, SessionId};
use crate::provider::{GenerationParams, ProviderKind};

/// Storage failure reported by a `MessageStore`
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced message does not exist
    #[error("message not found: {0}")]
    NotFound(MessageId),

    /// Backend-specific failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Message persistence used by the orchestrator.
///
/// Writes happen at generation boundaries, never per chunk: the user
/// message and assistant placeholder are persisted at submit time, and the
/// assistant message is updated once when the job reaches a terminal state.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message
    async fn insert(&self, message: Message) -> Result<(), StoreError>;

    /// Replace a persisted message with its finalized form
    async fn update(&self, message: Message) -> Result<(), StoreError>;

    /// Fetch one message
    async fn get(&self, id: MessageId) -> Result<Message, StoreError>;

    /// Fetch a session's messages in creation order
    async fn list_session(&self, session_id: SessionId) -> Result<Vec<Message>, StoreError>;
}

/// Effective generation settings for one session
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    /// Which provider serves the generation
    pub provider: ProviderKind,
    /// Model name passed to the provider
    pub model: String,
    /// Sampling parameters
    pub params: GenerationParams,
    /// Optional system prompt
    pub system: Option<String>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Ollama,
            model: "llama3".to_string(),
            params: GenerationParams::default(),
            system: None,
        }
    }
}

/// Resolves the settings in effect for a session at submit time.
///
/// Settings are read once per generation, so a settings change mid-stream
/// only affects the next generation.
#[async_trait]
pub trait SettingsResolver: Send + Sync {
    /// Effective settings for the session
    async fn resolve(&self, session_id: SessionId) -> GenerationSettings;
}

// ============================================================================
// In-Memory Implementations
// ============================================================================

/// In-memory message store
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: DashMap<MessageId, Message>,
}

impl MemoryMessageStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, message: Message) -> Result<(), StoreError> {
        self.messages.insert(message.id, message);
        Ok(())
    }

    async fn update(&self, message: Message) -> Result<(), StoreError> {
        if !self.messages.contains_key(&message.id) {
            return Err(StoreError::NotFound(message.id));
        }
        self.messages.insert(message.id, message);
        Ok(())
    }

    async fn get(&self, id: MessageId) -> Result<Message, StoreError> {
        self.messages
            .get(&id)
            .map(|m| m.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_session(&self, session_id: SessionId) -> Result<Vec<Message>, StoreError> {
        let mut messages: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .map(|m| m.clone())
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }
}

/// Settings resolver with a global default and per-session overrides.
///
/// A session override replaces the default wholesale. Overrides can be
/// updated at any time; in-flight generations keep the settings they
/// resolved at submit.
pub struct StaticSettingsResolver {
    default: GenerationSettings,
    overrides: DashMap<SessionId, GenerationSettings>,
}

impl StaticSettingsResolver {
    /// Create a resolver with the given default settings
    #[must_use]
    pub fn new(default: GenerationSettings) -> Self {
        Self {
            default,
            overrides: DashMap::new(),
        }
    }

    /// Set a session-level override
    pub fn set_override(&self, session_id: SessionId, settings: GenerationSettings) {
        self.overrides.insert(session_id, settings);
    }

    /// Remove a session-level override, falling back to the default
    pub fn clear_override(&self, session_id: SessionId) {
        self.overrides.remove(&session_id);
    }
}

impl Default for StaticSettingsResolver {
    fn default() -> Self {
        Self::new(GenerationSettings::default())
    }
}

#[async_trait]
impl SettingsResolver for StaticSettingsResolver {
    async fn resolve(&self, session_id: SessionId) -> GenerationSettings {
        self.overrides
            .get(&session_id)
            .map(|s| s.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}
