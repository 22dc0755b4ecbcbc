//! Wire Protocol Events
//!
//! Events exchanged with a connected client over a persistent per-session
//! connection. The transport itself (WebSocket, SSE, in-process channel) is
//! not mandated here; both directions are plain serde values.
//!
//! # Ordering Invariants
//!
//! For a given `message_id`:
//! - `chunk_index` values are strictly increasing and gapless, starting at 0
//! - exactly one of `stream_end` / `stream_error` terminates the sequence
//!
//! No ordering guarantee is made across different message ids.

use serde::{Deserialize, Serialize};

use crate::messages::{ContentPart, Message, MessageId, MessageRole, TokenUsage};
use crate::provider::ProviderKind;

/// Events sent by a client to the server
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Submit a message and trigger a generation
    SendMessage {
        /// Role of the submitted message (must be `user`)
        role: MessageRole,
        /// Ordered content parts
        content_parts: Vec<ContentPart>,
        /// Uploaded file keys to attach (opaque to this subsystem)
        #[serde(default)]
        files: Vec<String>,
        /// Links to attach (opaque to this subsystem)
        #[serde(default)]
        links: Vec<String>,
    },
    /// Request cancellation of an in-flight generation
    StopGeneration {
        /// The assistant message being generated
        message_id: MessageId,
    },
}

/// Events sent by the server to every connection of a session
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A message was persisted (user message echo, or the assistant
    /// placeholder before streaming begins)
    MessageCreated {
        /// The persisted message
        message: Message,
    },
    /// Generation produced its first delta
    StreamStart {
        /// The assistant message being generated
        message_id: MessageId,
        /// Role of the streamed message
        role: MessageRole,
        /// Provider producing the generation
        provider: ProviderKind,
        /// Model producing the generation
        model: String,
    },
    /// One incremental content chunk
    StreamChunk {
        /// The assistant message being generated
        message_id: MessageId,
        /// The chunk payload
        chunk: ContentPart,
        /// Strictly increasing, gapless index starting at 0
        chunk_index: u64,
    },
    /// Generation finished (completed or cancelled)
    StreamEnd {
        /// The assistant message that finished
        message_id: MessageId,
        /// Token usage, when the provider reported it
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        /// Milliseconds from submit to first token
        #[serde(skip_serializing_if = "Option::is_none")]
        first_token_latency_ms: Option<u64>,
    },
    /// Generation failed with a classified provider error
    StreamError {
        /// The assistant message that failed
        message_id: MessageId,
        /// Readable error description
        error: String,
    },
}

impl ServerEvent {
    /// The message id this event belongs to
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        match self {
            Self::MessageCreated { message } => message.id,
            Self::StreamStart { message_id, .. }
            | Self::StreamChunk { message_id, .. }
            | Self::StreamEnd { message_id, .. }
            | Self::StreamError { message_id, .. } => *message_id,
        }
    }

    /// Whether this event terminates its message id's event sequence
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StreamEnd { .. } | Self::StreamError { .. })
    }
}
