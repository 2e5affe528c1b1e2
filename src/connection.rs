//! Connection Registry (C6)
//!
//! Maps a session ID to its outbound sender. Grounded in the teacher's
//! `call_server.rs::CallManager`: a concurrent map from call/session id to
//! a handle the rest of the system can push outbound frames through,
//! without ever touching the socket itself outside the one writer task
//! that owns it (Invariant I5: a connection is a single-writer resource).

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

struct ConnectionEntry {
    sender: mpsc::Sender<Message>,
    unresolved: Arc<AtomicU64>,
}

pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
        })
    }

    /// Register a freshly-accepted connection. Returns the shared
    /// unresolved-chunk counter ingress uses for its backpressure cap.
    pub(crate) fn register(&self, session_id: String, sender: mpsc::Sender<Message>) -> Arc<AtomicU64> {
        let unresolved = Arc::new(AtomicU64::new(0));
        self.connections.insert(
            session_id,
            ConnectionEntry {
                sender,
                unresolved: unresolved.clone(),
            },
        );
        unresolved
    }

    pub(crate) fn unregister(&self, session_id: &str) {
        self.connections.remove(session_id);
    }

    /// Enqueue `message` on the connection's writer channel. `false` if
    /// no connection is registered for `session_id` (already closed).
    pub(crate) async fn send(&self, session_id: &str, message: Message) -> bool {
        let sender = self
            .connections
            .get(session_id)
            .map(|entry| entry.sender.clone());
        match sender {
            Some(sender) => sender.send(message).await.is_ok(),
            None => false,
        }
    }

    pub(crate) fn unresolved_counter(&self, session_id: &str) -> Option<Arc<AtomicU64>> {
        self.connections
            .get(session_id)
            .map(|entry| entry.unresolved.clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

pub(crate) fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_to_unknown_session_returns_false() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send("nope", Message::Text("x".to_string())).await);
    }

    #[tokio::test]
    async fn registered_connection_receives_sent_messages() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register("s1".to_string(), tx);

        assert!(registry.send("s1", Message::Text("hi".to_string())).await);
        let received = rx.recv().await.unwrap();
        assert_eq!(received, Message::Text("hi".to_string()));
    }

    #[tokio::test]
    async fn unregister_removes_the_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry.register("s1".to_string(), tx);
        registry.unregister("s1");
        assert!(registry.is_empty());
    }

    #[test]
    fn decrement_saturates_at_zero() {
        let counter = AtomicU64::new(0);
        decrement(&counter);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
