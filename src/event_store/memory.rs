//! In-memory event store
//!
//! Map-backed store for tests and embedded setups. A single write lock
//! per structure; version monotonicity enforced on append.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::event::Event;

use super::{
    validate_batch, AggregateInspector, EventStore, EventStoreError, StreamOptions,
    StreamingEventStore, TypedEventStore,
};

/// In-memory event store keyed by aggregate id.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<i64, Vec<Event>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous append used by the async port and by the in-memory
    /// outbox repository, which batches both writes under its own lock.
    pub(crate) fn append_sync(
        &self,
        aggregate_id: i64,
        events: &[Event],
        expected_version: i64,
    ) -> Result<(), EventStoreError> {
        if events.is_empty() {
            return Ok(());
        }
        validate_batch(aggregate_id, events, expected_version)?;

        let mut streams = self.streams.write().expect("event store lock poisoned");
        let stream = streams.entry(aggregate_id).or_default();

        let tail = stream.last().map(|e| e.version).unwrap_or(0);
        if tail != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual: tail,
            });
        }

        stream.extend(events.iter().cloned());
        Ok(())
    }

    fn load_sync(&self, aggregate_id: i64, after_version: i64) -> Vec<Event> {
        let streams = self.streams.read().expect("event store lock poisoned");
        streams
            .get(&aggregate_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.version > after_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_events(
        &self,
        aggregate_id: i64,
        events: &[Event],
        expected_version: i64,
    ) -> Result<(), EventStoreError> {
        self.append_sync(aggregate_id, events, expected_version)
    }

    async fn load_events(
        &self,
        aggregate_id: i64,
        after_version: i64,
    ) -> Result<Vec<Event>, EventStoreError> {
        Ok(self.load_sync(aggregate_id, after_version))
    }

    fn as_inspector(&self) -> Option<&dyn AggregateInspector> {
        Some(self)
    }

    fn as_typed(&self) -> Option<&dyn TypedEventStore> {
        Some(self)
    }

    fn as_streaming(&self) -> Option<&dyn StreamingEventStore> {
        Some(self)
    }
}

#[async_trait]
impl AggregateInspector for InMemoryEventStore {
    async fn has_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: i64,
    ) -> Result<bool, EventStoreError> {
        let streams = self.streams.read().expect("event store lock poisoned");
        Ok(streams
            .get(&aggregate_id)
            .is_some_and(|s| s.iter().any(|e| e.aggregate_type == aggregate_type)))
    }

    async fn aggregate_version(
        &self,
        aggregate_type: &str,
        aggregate_id: i64,
    ) -> Result<i64, EventStoreError> {
        let streams = self.streams.read().expect("event store lock poisoned");
        Ok(streams
            .get(&aggregate_id)
            .and_then(|s| {
                s.iter()
                    .rev()
                    .find(|e| e.aggregate_type == aggregate_type)
                    .map(|e| e.version)
            })
            .unwrap_or(0))
    }
}

#[async_trait]
impl TypedEventStore for InMemoryEventStore {
    async fn load_events_by_type(
        &self,
        aggregate_type: &str,
        aggregate_id: i64,
        after_version: i64,
    ) -> Result<Vec<Event>, EventStoreError> {
        Ok(self
            .load_sync(aggregate_id, after_version)
            .into_iter()
            .filter(|e| e.aggregate_type == aggregate_type)
            .collect())
    }
}

#[async_trait]
impl StreamingEventStore for InMemoryEventStore {
    async fn stream_aggregate(
        &self,
        options: &StreamOptions,
    ) -> Result<Vec<Event>, EventStoreError> {
        let mut events: Vec<Event> = self
            .load_sync(options.aggregate_id, options.after_version)
            .into_iter()
            .filter(|e| {
                options.aggregate_type.is_empty() || e.aggregate_type == options.aggregate_type
            })
            .collect();

        if let Some(limit) = options.limit {
            events.truncate(limit.max(0) as usize);
        }
        Ok(events)
    }
}
