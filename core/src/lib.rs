//! Genstream Core - Real-Time Generation Streaming
//!
//! This crate drives AI text generations from provider APIs out to
//! connected clients in real time. It is transport-agnostic: the wire
//! events are plain serde values that can ride a WebSocket, SSE stream,
//! or an in-process channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Connected Clients                        │
//! │   ┌──────────┐   ┌──────────┐   ┌──────────────────────┐     │
//! │   │  Tab A   │   │  Tab B   │   │  Other sessions      │     │
//! │   └────┬─────┘   └────┬─────┘   └──────────┬───────────┘     │
//! │        │              │                    │                 │
//! │        └──────────────┴────────────────────┘                 │
//! │                       │                                      │
//! │                ClientEvent (up)                              │
//! │                ServerEvent (down)                            │
//! └───────────────────────┼──────────────────────────────────────┘
//!                         │
//! ┌───────────────────────┼──────────────────────────────────────┐
//! │                 GENSTREAM CORE                               │
//! │  ┌────────────────────┴───────────────────────────────────┐  │
//! │  │                  Orchestrator                          │  │
//! │  │  ┌─────────┐ ┌──────────┐ ┌─────────┐ ┌─────────────┐  │  │
//! │  │  │  Job    │ │ Session  │ │ Cancel  │ │  Provider   │  │  │
//! │  │  │Registry │ │ Streams  │ │ Control │ │  Adapters   │  │  │
//! │  │  └─────────┘ └──────────┘ └─────────┘ └─────────────┘  │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Orchestrator`]: Submits generations and drives them to completion
//! - [`ProviderAdapter`]: Trait hiding each provider's wire format
//! - [`SessionStreamManager`]: Fans server events out per session
//! - [`JobRegistry`]: Tracks in-flight generations by message id
//! - [`CancellationController`]: Cooperative stop requests
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use genstream_core::{
//!     config, ContentPart, JobRegistry, Orchestrator, ProviderRegistry,
//!     SessionStreamManager,
//!     store::{MemoryMessageStore, StaticSettingsResolver},
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = config::load_config()?;
//!     let providers = Arc::new(ProviderRegistry::from_env(cfg.retry)?);
//!     let streams = Arc::new(SessionStreamManager::new(cfg.connection_queue_size));
//!     let orchestrator = Orchestrator::new(
//!         Arc::new(MemoryMessageStore::new()),
//!         Arc::new(StaticSettingsResolver::default()),
//!         providers,
//!         streams.clone(),
//!         Arc::new(JobRegistry::new()),
//!         cfg,
//!     );
//!
//!     let session = genstream_core::SessionId::new();
//!     let (_conn, mut events) = streams.subscribe(session);
//!     orchestrator
//!         .submit(session, vec![ContentPart::text("Hello!")])
//!         .await?;
//!
//!     while let Some(event) = events.recv().await {
//!         // Forward to the client transport
//!         if event.is_terminal() {
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`messages`]: Messages, content parts, and identifiers
//! - [`events`]: Client/server wire events
//! - [`provider`]: Provider adapters (OpenAI, Anthropic, Ollama)
//! - [`job`]: Generation job state machine and registry
//! - [`streaming`]: Per-session event fanout
//! - [`store`]: Persistence and settings collaborator traits
//! - [`orchestrator`]: Submission and drive loop
//! - [`cancel`]: Cancellation controller
//! - [`config`]: TOML + environment configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod config;
pub mod events;
pub mod job;
pub mod messages;
pub mod orchestrator;
pub mod provider;
pub mod store;
pub mod streaming;

// Re-exports for convenience
pub use cancel::CancellationController;
pub use config::{ConfigError, StreamConfig};
pub use events::{ClientEvent, ServerEvent};
pub use job::{JobHandle, JobRegistry, JobState};
pub use messages::{
    ContentPart, Message, MessageId, MessageRole, MessageStatus, SessionId, StatusLevel,
    TokenUsage,
};
pub use orchestrator::{EventOutcome, Orchestrator, SubmitError, SubmitReceipt};
pub use provider::{
    Delta, GenerationParams, PromptContext, PromptMessage, ProviderAdapter, ProviderError,
    ProviderKind, ProviderRegistry, RetryPolicy,
};
pub use store::{
    GenerationSettings, MemoryMessageStore, MessageStore, SettingsResolver,
    StaticSettingsResolver, StoreError,
};
pub use streaming::{ConnectionId, SessionStreamManager};
