//! Session Stream Manager - Per-Session Connection Fanout
//!
//! Tracks which client connections are subscribed to which sessions and
//! fans server events out to them. A user with the same session open in
//! two browser tabs holds two connections on one session topic; both see
//! the same event sequence.
//!
//! # Architecture
//!
//! ```text
//!                 SessionStreamManager
//!                ┌──────────────────────────────────┐
//!                │ DashMap<SessionId, SessionTopic> │
//!                └───────────────┬──────────────────┘
//!                                │
//!            ┌───────────────────┼───────────────────┐
//!            │                   │                   │
//!     ┌──────▼──────┐     ┌──────▼──────┐     ┌──────▼──────┐
//!     │ Tab A       │     │ Tab B       │     │ Other user  │
//!     │  conn_1     │     │  conn_2     │     │  conn_3     │
//!     └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! # Ordering
//!
//! `publish` holds the topic's subscriber lock for the whole fanout, so
//! two publishes to the same session cannot interleave: every connection
//! observes events in publish order. Different sessions never contend.
//!
//! # Slow Consumers
//!
//! Each connection has a bounded queue. `publish` uses `try_send`; a full
//! queue means the consumer has fallen an entire buffer behind, and the
//! connection is dropped rather than allowed to stall the generation.
//!
//! # Late Joiners
//!
//! Stream events for a message go only to the connections that were
//! subscribed when its `stream_start` was published. A connection joining
//! mid-stream would otherwise observe a chunk suffix with indices starting
//! above zero; instead it sees nothing of the live stream and reads the
//! finished message from the store.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::events::ServerEvent;
use crate::messages::{MessageId, SessionId};

/// Unique identifier for a client connection
///
/// Each connection is assigned a unique ID when it subscribes.
/// This ID is stable for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One subscribed connection on a session topic
struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
}

/// Subscribers of a single session
#[derive(Default)]
struct SessionTopic {
    connections: parking_lot::Mutex<Vec<ConnectionHandle>>,
    /// Connections present when each live stream started, keyed by the
    /// streaming message. Entries are cleared at the terminal event.
    stream_audiences: parking_lot::Mutex<HashMap<MessageId, Vec<ConnectionId>>>,
}

/// Result of publishing an event to a session
#[derive(Debug, Clone)]
pub struct PublishResult {
    /// Connections that accepted the event
    pub delivered: usize,
    /// Connections dropped for falling behind or disconnecting
    pub dropped: Vec<ConnectionId>,
}

/// Manages per-session event fanout to connected clients
pub struct SessionStreamManager {
    topics: DashMap<SessionId, Arc<SessionTopic>>,
    queue_size: usize,
}

impl Default for SessionStreamManager {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SessionStreamManager {
    /// Create a manager with the given per-connection queue size
    #[must_use]
    pub fn new(queue_size: usize) -> Self {
        Self {
            topics: DashMap::new(),
            queue_size: queue_size.max(1),
        }
    }

    /// Subscribe a new connection to a session.
    ///
    /// Returns the connection id and the receiving half of its event
    /// queue. The connection joins the audiences of streams that start
    /// after this call; streams already live are not replayed to it.
    pub fn subscribe(&self, session_id: SessionId) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(self.queue_size);
        let id = ConnectionId::new();

        let topic = self
            .topics
            .entry(session_id)
            .or_insert_with(|| Arc::new(SessionTopic::default()))
            .clone();
        topic.connections.lock().push(ConnectionHandle { id, tx });

        tracing::info!(
            session_id = %session_id,
            connection_id = %id,
            "connection subscribed"
        );
        (id, rx)
    }

    /// Remove a connection from a session.
    ///
    /// Returns true if the connection was subscribed.
    pub fn unsubscribe(&self, session_id: SessionId, id: ConnectionId) -> bool {
        let Some(topic) = self.topics.get(&session_id).map(|t| t.clone()) else {
            return false;
        };
        let mut connections = topic.connections.lock();
        let before = connections.len();
        connections.retain(|c| c.id != id);
        let removed = connections.len() < before;
        if removed {
            tracing::info!(
                session_id = %session_id,
                connection_id = %id,
                "connection unsubscribed"
            );
        }
        removed
    }

    /// Publish an event to a session's connections.
    ///
    /// `stream_start` snapshots the current connections as the stream's
    /// audience; subsequent chunk and terminal events for that message go
    /// only to the snapshot, so a mid-stream joiner never sees a partial
    /// chunk suffix. Events without a recorded audience go to everyone.
    ///
    /// Uses `try_send` to avoid blocking on slow consumers; a connection
    /// whose queue is full (or whose receiver is gone) is dropped from the
    /// topic. Holding the topic lock for the whole loop keeps concurrent
    /// publishes to the same session in order.
    pub fn publish(&self, session_id: SessionId, event: &ServerEvent) -> PublishResult {
        let Some(topic) = self.topics.get(&session_id).map(|t| t.clone()) else {
            return PublishResult {
                delivered: 0,
                dropped: Vec::new(),
            };
        };

        let mut connections = topic.connections.lock();

        let audience = {
            let mut audiences = topic.stream_audiences.lock();
            match event {
                ServerEvent::StreamStart { message_id, .. } => {
                    let ids: Vec<ConnectionId> = connections.iter().map(|c| c.id).collect();
                    audiences.insert(*message_id, ids.clone());
                    Some(ids)
                }
                ServerEvent::StreamChunk { message_id, .. } => audiences.get(message_id).cloned(),
                ServerEvent::StreamEnd { message_id, .. }
                | ServerEvent::StreamError { message_id, .. } => audiences.remove(message_id),
                ServerEvent::MessageCreated { .. } => None,
            }
        };

        let mut delivered = 0;
        let mut dropped = Vec::new();

        connections.retain(|conn| {
            if audience.as_ref().is_some_and(|ids| !ids.contains(&conn.id)) {
                return true;
            }
            match conn.tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        session_id = %session_id,
                        connection_id = %conn.id,
                        "dropping slow connection"
                    );
                    dropped.push(conn.id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(conn.id);
                    false
                }
            }
        });

        PublishResult { delivered, dropped }
    }

    /// Number of connections subscribed to a session
    #[must_use]
    pub fn connection_count(&self, session_id: SessionId) -> usize {
        self.topics
            .get(&session_id)
            .map_or(0, |t| t.connections.lock().len())
    }

    /// Drop session topics with no remaining connections.
    ///
    /// Returns the number of topics removed.
    pub fn cleanup_empty(&self) -> usize {
        let before = self.topics.len();
        self.topics
            .retain(|_, topic| !topic.connections.lock().is_empty());
        before - self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, MessageRole};

    fn test_event() -> ServerEvent {
        ServerEvent::MessageCreated {
            message: Message::user(SessionId::new(), vec![]),
        }
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new();
        assert!(format!("{id}").starts_with("conn-"));
    }

    #[test]
    fn test_subscribe_and_publish() {
        let manager = SessionStreamManager::new(16);
        let session = SessionId::new();
        let (_, mut rx_a) = manager.subscribe(session);
        let (_, mut rx_b) = manager.subscribe(session);

        let result = manager.publish(session, &test_event());
        assert_eq!(result.delivered, 2);
        assert!(result.dropped.is_empty());

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_publish_to_unknown_session() {
        let manager = SessionStreamManager::new(16);
        let result = manager.publish(SessionId::new(), &test_event());
        assert_eq!(result.delivered, 0);
    }

    #[test]
    fn test_sessions_are_isolated() {
        let manager = SessionStreamManager::new(16);
        let session_a = SessionId::new();
        let session_b = SessionId::new();
        let (_, mut rx_a) = manager.subscribe(session_a);
        let (_, mut rx_b) = manager.subscribe(session_b);

        manager.publish(session_a, &test_event());
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe() {
        let manager = SessionStreamManager::new(16);
        let session = SessionId::new();
        let (id, _rx) = manager.subscribe(session);

        assert!(manager.unsubscribe(session, id));
        assert!(!manager.unsubscribe(session, id));
        assert_eq!(manager.connection_count(session), 0);
    }

    #[test]
    fn test_slow_consumer_is_dropped() {
        let manager = SessionStreamManager::new(1);
        let session = SessionId::new();
        let (id, _rx) = manager.subscribe(session);

        // First publish fills the queue, second finds it full
        assert_eq!(manager.publish(session, &test_event()).delivered, 1);
        let result = manager.publish(session, &test_event());
        assert_eq!(result.delivered, 0);
        assert_eq!(result.dropped, vec![id]);
        assert_eq!(manager.connection_count(session), 0);
    }

    #[test]
    fn test_closed_receiver_is_dropped() {
        let manager = SessionStreamManager::new(16);
        let session = SessionId::new();
        let (id, rx) = manager.subscribe(session);
        drop(rx);

        let result = manager.publish(session, &test_event());
        assert_eq!(result.dropped, vec![id]);
    }

    #[test]
    fn test_cleanup_empty_topics() {
        let manager = SessionStreamManager::new(16);
        let session = SessionId::new();
        let (id, _rx) = manager.subscribe(session);
        manager.unsubscribe(session, id);

        assert_eq!(manager.cleanup_empty(), 1);
    }

    #[test]
    fn test_mid_stream_subscriber_is_not_addressed() {
        use crate::messages::{ContentPart, MessageRole};
        use crate::provider::ProviderKind;

        let manager = SessionStreamManager::new(16);
        let session = SessionId::new();
        let message_id = MessageId::new();
        let (_, mut rx_a) = manager.subscribe(session);

        let start = ServerEvent::StreamStart {
            message_id,
            role: MessageRole::Assistant,
            provider: ProviderKind::Ollama,
            model: "llama3".to_string(),
        };
        assert_eq!(manager.publish(session, &start).delivered, 1);

        // B joins mid-stream and is outside this stream's audience
        let (_, mut rx_b) = manager.subscribe(session);

        let chunk = ServerEvent::StreamChunk {
            message_id,
            chunk: ContentPart::text("hi"),
            chunk_index: 0,
        };
        assert_eq!(manager.publish(session, &chunk).delivered, 1);

        let end = ServerEvent::StreamEnd {
            message_id,
            usage: None,
            first_token_latency_ms: None,
        };
        assert_eq!(manager.publish(session, &end).delivered, 1);

        // A saw the whole stream, B saw none of it
        for _ in 0..3 {
            assert!(rx_a.try_recv().is_ok());
        }
        assert!(rx_b.try_recv().is_err());

        // The terminal event cleared the audience; events for an unknown
        // message fall back to a full broadcast
        assert_eq!(manager.publish(session, &end).delivered, 2);
    }

    #[tokio::test]
    async fn test_per_session_publish_order() {
        use tokio::task::JoinSet;

        let manager = Arc::new(SessionStreamManager::new(256));
        let session = SessionId::new();
        let (_, mut rx) = manager.subscribe(session);

        let mut join_set = JoinSet::new();
        for _ in 0..10 {
            let manager = Arc::clone(&manager);
            join_set.spawn(async move {
                for _ in 0..10 {
                    manager.publish(session, &test_event());
                }
            });
        }
        while join_set.join_next().await.is_some() {}

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 100);
    }
}
