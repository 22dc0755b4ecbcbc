//! Message Data Model
//!
//! The persisted shape of a conversation message and its building blocks:
//! ids, roles, content parts, token usage, and terminal statuses.
//!
//! # Design Philosophy
//!
//! A message is append-only while it is being generated and immutable once
//! `generating` flips to false. Streaming code only ever appends content
//! parts; it never reorders or removes them. Everything here is plain data
//! with serde derives so the same types travel over the wire and into the
//! message store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generate a new unique message ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a new unique session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who sent a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// User input
    User,
    /// AI assistant
    Assistant,
    /// System message
    System,
}

/// One unit of message content
///
/// Messages are ordered lists of parts. A streaming response grows by
/// appending parts (consecutive text fragments are coalesced into the
/// trailing text part).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text content
    Text {
        /// The text
        text: String,
    },
    /// An uploaded image, referenced by storage key
    Image {
        /// Storage key of the image
        key: String,
    },
    /// A tool invocation requested by the model
    ToolCall {
        /// Provider-assigned call id
        id: String,
        /// Tool name
        name: String,
        /// Arguments as a JSON string (may arrive in fragments)
        arguments: String,
    },
    /// The result of a tool invocation
    ToolResult {
        /// Call id this result answers
        id: String,
        /// Tool output
        output: String,
    },
    /// Model reasoning/thinking content
    Reasoning {
        /// The reasoning text
        text: String,
    },
}

impl ContentPart {
    /// Create a text part
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Get the text if this is a text part
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Token usage reported by a provider at the end of a generation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt
    pub prompt_tokens: u32,
    /// Tokens produced in the completion
    pub completion_tokens: u32,
    /// Total tokens
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Create a usage summary, deriving the total
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Severity of a terminal message status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    /// Informational (e.g. stopped by user)
    Info,
    /// Warning
    Warning,
    /// Error
    Error,
}

/// A human-readable status attached to a message when it reaches a
/// terminal state other than plain completion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStatus {
    /// Severity level
    #[serde(rename = "type")]
    pub level: StatusLevel,
    /// Readable status text
    pub text: String,
}

impl MessageStatus {
    /// Create an info-level status
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Info,
            text: text.into(),
        }
    }

    /// Create an error-level status
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Error,
            text: text.into(),
        }
    }
}

/// A conversation message
///
/// While `generating` is true the `parts` list may be appended to but never
/// reordered or truncated. Once `generating` is false the message is
/// immutable and carries at least one content part.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: MessageId,
    /// Session this message belongs to
    pub session_id: SessionId,
    /// Who sent this message
    pub role: MessageRole,
    /// Ordered content parts
    pub parts: Vec<ContentPart>,
    /// Whether the message is still being generated
    pub generating: bool,
    /// When the message was created
    pub created_at: DateTime<Utc>,
    /// Token usage (set on completion)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Milliseconds from submit to first streamed token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_token_latency_ms: Option<u64>,
    /// Terminal statuses (empty for a plainly completed message)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status: Vec<MessageStatus>,
    /// Error text for failed generations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// Create a finalized user message
    #[must_use]
    pub fn user(session_id: SessionId, parts: Vec<ContentPart>) -> Self {
        Self {
            id: MessageId::new(),
            session_id,
            role: MessageRole::User,
            parts,
            generating: false,
            created_at: Utc::now(),
            usage: None,
            first_token_latency_ms: None,
            status: Vec::new(),
            error: None,
        }
    }

    /// Create an empty assistant message with `generating` set
    ///
    /// This is the placeholder persisted before the first delta arrives.
    #[must_use]
    pub fn generating_assistant(session_id: SessionId) -> Self {
        Self {
            id: MessageId::new(),
            session_id,
            role: MessageRole::Assistant,
            parts: Vec::new(),
            generating: true,
            created_at: Utc::now(),
            usage: None,
            first_token_latency_ms: None,
            status: Vec::new(),
            error: None,
        }
    }

    /// Append a content part, coalescing consecutive text parts
    pub fn push_part(&mut self, part: ContentPart) {
        if let ContentPart::Text { text: more } = &part {
            if let Some(ContentPart::Text { text }) = self.parts.last_mut() {
                text.push_str(more);
                return;
            }
        }
        if let ContentPart::Reasoning { text: more } = &part {
            if let Some(ContentPart::Reasoning { text }) = self.parts.last_mut() {
                text.push_str(more);
                return;
            }
        }
        self.parts.push(part);
    }

    /// Concatenated text of all text parts
    #[must_use]
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(ContentPart::as_text)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_message_id_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
    }

    #[test]
    fn test_push_part_coalesces_text() {
        let mut msg = Message::generating_assistant(SessionId::new());
        msg.push_part(ContentPart::text("Hi"));
        msg.push_part(ContentPart::text(" there"));
        assert_eq!(msg.parts.len(), 1);
        assert_eq!(msg.text(), "Hi there");
    }

    #[test]
    fn test_push_part_keeps_distinct_kinds_ordered() {
        let mut msg = Message::generating_assistant(SessionId::new());
        msg.push_part(ContentPart::text("a"));
        msg.push_part(ContentPart::Reasoning {
            text: "because".to_string(),
        });
        msg.push_part(ContentPart::text("b"));
        assert_eq!(msg.parts.len(), 3);
        assert_eq!(msg.text(), "ab");
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(5, 2);
        assert_eq!(usage.total_tokens, 7);
    }

    #[test]
    fn test_content_part_serde_shape() {
        let part = ContentPart::text("hello");
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hello");
    }

    #[test]
    fn test_status_serde_shape() {
        let status = MessageStatus::info("stopped by user");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "info");
        assert_eq!(json["text"], "stopped by user");
    }
}
