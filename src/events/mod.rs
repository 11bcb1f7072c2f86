//! # Event Bus
//!
//! In-process publish/subscribe over named topics. Delivery is synchronous on
//! the publishing task; the subscriber list is snapshotted before dispatch so
//! subscribing from inside a handler never mutates a list mid-delivery.
//! Handlers must not block.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::debug;

/// Topic published when a breaker changes state
pub const TOPIC_STATE_CHANGE: &str = "circuit:state-change";
/// Topic published on every recorded breaker failure
pub const TOPIC_FAILURE: &str = "circuit:failure";
/// Topic published when a breaker is force-reset
pub const TOPIC_RESET: &str = "circuit:reset";

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Synchronous topic-based event bus
#[derive(Default)]
pub struct EventBus {
    topics: RwLock<HashMap<String, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a topic.
    pub fn subscribe<F>(&self, topic: &str, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Deliver a payload to every subscriber of the topic.
    pub fn publish(&self, topic: &str, payload: &Value) {
        let handlers: Vec<Handler> = {
            let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
            match topics.get(topic) {
                Some(handlers) => handlers.clone(),
                None => return,
            }
        };
        debug!(topic, subscribers = handlers.len(), "publishing event");
        for handler in handlers {
            handler(payload);
        }
    }

    /// Number of subscribers on a topic (introspection for tests/health).
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        topics.get(topic).map(|h| h.len()).unwrap_or(0)
    }
}
