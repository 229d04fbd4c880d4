//! Event bus
//!
//! Publication port consumed by the repository adapter and the outbox
//! publisher, plus an in-process implementation that fans events out to
//! registered handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::event::Event;

/// Errors surfaced by bus implementations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Handler failed: {0}")]
    HandlerFailed(String),
}

/// Subscriber callback.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), BusError>;
}

pub type SubscriptionId = u64;

/// Publication port. Delivery semantics are best-effort fan-out; the
/// outbox layer on top is what makes delivery reliable.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish_event(&self, event: &Event) -> Result<(), BusError>;

    async fn publish_events(&self, events: &[Event]) -> Result<(), BusError> {
        for event in events {
            self.publish_event(event).await?;
        }
        Ok(())
    }

    /// Register a handler for one event type. The empty string
    /// subscribes to every event.
    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId;

    async fn unsubscribe(&self, event_type: &str, id: SubscriptionId);
}

/// In-process bus delivering to subscribers of the event type and to
/// wildcard subscribers. Handler errors are logged, never propagated.
#[derive(Default)]
pub struct InMemoryEventBus {
    subscribers: RwLock<HashMap<String, Vec<(SubscriptionId, Arc<dyn EventHandler>)>>>,
    next_id: AtomicU64,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn handlers_for(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        let subscribers = self.subscribers.read().await;
        let mut handlers = Vec::new();
        if let Some(list) = subscribers.get(event_type) {
            handlers.extend(list.iter().map(|(_, h)| h.clone()));
        }
        if !event_type.is_empty() {
            if let Some(list) = subscribers.get("") {
                handlers.extend(list.iter().map(|(_, h)| h.clone()));
            }
        }
        handlers
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish_event(&self, event: &Event) -> Result<(), BusError> {
        let handlers = self.handlers_for(&event.event_type).await;

        for handler in handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "event handler failed"
                );
            }
        }
        Ok(())
    }

    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut subscribers = self.subscribers.write().await;
        subscribers
            .entry(event_type.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    async fn unsubscribe(&self, event_type: &str, id: SubscriptionId) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(list) = subscribers.get_mut(event_type) {
            list.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}
