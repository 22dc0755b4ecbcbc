//! Streaming Infrastructure
//!
//! Per-session event fanout. Generation jobs publish their server events
//! through the `SessionStreamManager`, which delivers them to every
//! connection subscribed to the session.

pub mod session_streams;

pub use session_streams::{ConnectionId, PublishResult, SessionStreamManager};
