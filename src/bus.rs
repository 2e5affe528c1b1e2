//! Event Bus (C1)
//!
//! Topic-keyed pub/sub with concurrent fan-out. Generalizes the teacher's
//! Handle-keyed broadcast-channel registry to a topic-keyed handler list:
//! subscribers are plain trait objects rather than broadcast receivers, so
//! `publish` can isolate a failing handler without tearing down a channel
//! shared by others.

use crate::model::Event;
use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

const HISTORY_CAPACITY: usize = 1000;

/// A subscriber to one or more topics. Implementors must be cheap to
/// clone via `Arc` and safe to invoke concurrently with themselves.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event);
}

/// In-process publish/subscribe bus.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    history: RwLock<VecDeque<Event>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    /// Deliver `event` to every current subscriber of its topic. Returns
    /// once every handler has been scheduled — not once they've finished.
    /// Snapshot semantics: subscribe/unsubscribe calls racing this publish
    /// never affect the handler set already dispatched.
    pub fn publish(&self, event: Event) {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let subs = self.subscribers.read();
            subs.get(event.topic()).cloned().unwrap_or_default()
        };

        {
            let mut history = self.history.write();
            if history.len() >= HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        for handler in handlers {
            let event = event.clone();
            tokio::spawn(async move {
                let correlation_id = event.correlation_id.clone();
                let topic = event.topic();
                let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
                if let Err(panic) = outcome {
                    let message = panic_message(&panic);
                    tracing::error!(
                        topic,
                        correlation_id,
                        error = %message,
                        "event handler panicked; isolated from publisher and siblings"
                    );
                }
            });
        }
    }

    /// Register `handler` for `topic`. Idempotent for the same
    /// `(topic, handler)` pair, compared by pointer identity.
    pub fn subscribe(&self, topic: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let topic = topic.into();
        let mut subs = self.subscribers.write();
        let entry = subs.entry(topic).or_default();
        if !entry.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            entry.push(handler);
        }
    }

    /// Remove `handler` from `topic`. No-op if absent.
    pub fn unsubscribe(&self, topic: &str, handler: &Arc<dyn EventHandler>) {
        let mut subs = self.subscribers.write();
        if let Some(entry) = subs.get_mut(topic) {
            entry.retain(|h| !Arc::ptr_eq(h, handler));
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .read()
            .get(topic)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Clear subscribers for one topic, or every topic if `None`.
    pub fn clear(&self, topic: Option<&str>) {
        let mut subs = self.subscribers.write();
        match topic {
            Some(t) => {
                subs.remove(t);
            }
            None => subs.clear(),
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkIn, EventPayload};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: Event) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl EventHandler for PanickingHandler {
        async fn handle(&self, _event: Event) {
            panic!("boom");
        }
    }

    fn sample_event() -> Event {
        Event::new(
            "test",
            "s:0".to_string(),
            EventPayload::ChunkIn(ChunkIn {
                session_id: "s".to_string(),
                chunk_id: 0,
                data: vec![1, 2, 3],
                sample_rate: 16_000,
                channels: 1,
            }),
        )
    }

    #[tokio::test]
    async fn publish_dispatches_to_all_subscribers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handler: Arc<dyn EventHandler> = Arc::new(CountingHandler {
            count: count.clone(),
        });
        bus.subscribe("chunk_in", handler);

        bus.publish(sample_event());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let bus = EventBus::new();
        let handler: Arc<dyn EventHandler> = Arc::new(CountingHandler {
            count: Arc::new(AtomicUsize::new(0)),
        });
        bus.subscribe("chunk_in", handler.clone());
        bus.subscribe("chunk_in", handler.clone());
        assert_eq!(bus.subscriber_count("chunk_in"), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_registration() {
        let bus = EventBus::new();
        let handler: Arc<dyn EventHandler> = Arc::new(CountingHandler {
            count: Arc::new(AtomicUsize::new(0)),
        });
        bus.subscribe("chunk_in", handler.clone());
        bus.unsubscribe("chunk_in", &handler);
        assert_eq!(bus.subscriber_count("chunk_in"), 0);
    }

    #[tokio::test]
    async fn handler_panic_does_not_affect_sibling() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe("chunk_in", Arc::new(PanickingHandler) as Arc<dyn EventHandler>);
        bus.subscribe(
            "chunk_in",
            Arc::new(CountingHandler {
                count: count.clone(),
            }) as Arc<dyn EventHandler>,
        );

        bus.publish(sample_event());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_subscribers_is_not_an_error() {
        let bus = EventBus::new();
        bus.publish(sample_event());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
