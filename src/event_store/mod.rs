//! Event store module
//!
//! Append/load port for aggregate event streams, optional capability
//! interfaces, and the in-memory and PostgreSQL implementations.

mod error;
pub mod memory;
pub mod postgres;

pub use error::EventStoreError;
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;

use async_trait::async_trait;

use crate::event::Event;

/// Options for a paginated stream read.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub aggregate_type: String,
    pub aggregate_id: i64,
    pub after_version: i64,
    pub limit: Option<i64>,
}

/// Append/load port for one aggregate's event stream.
///
/// Implementations may expose extra capabilities through the `as_*`
/// probes; callers that can use them check at runtime and degrade
/// gracefully when they get `None`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically append a batch with optimistic concurrency control.
    ///
    /// The batch must carry versions `expected_version + 1,
    /// expected_version + 2, ...` and the stored tail must equal
    /// `expected_version`, otherwise the append fails with
    /// `InvalidVersion` or `ConcurrencyConflict` respectively.
    async fn append_events(
        &self,
        aggregate_id: i64,
        events: &[Event],
        expected_version: i64,
    ) -> Result<(), EventStoreError>;

    /// Load events with `version > after_version`, ascending by version.
    ///
    /// An unknown aggregate yields an empty list or
    /// `AggregateNotFound` at the implementation's choice.
    async fn load_events(
        &self,
        aggregate_id: i64,
        after_version: i64,
    ) -> Result<Vec<Event>, EventStoreError>;

    /// O(1) existence/version queries, when supported.
    fn as_inspector(&self) -> Option<&dyn AggregateInspector> {
        None
    }

    /// Type-filtered loads, when supported.
    fn as_typed(&self) -> Option<&dyn TypedEventStore> {
        None
    }

    /// Paginated stream reads, when supported.
    fn as_streaming(&self) -> Option<&dyn StreamingEventStore> {
        None
    }
}

/// Existence and tail-version queries without loading the stream.
#[async_trait]
pub trait AggregateInspector: Send + Sync {
    async fn has_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: i64,
    ) -> Result<bool, EventStoreError>;

    /// Tail version of the stream; 0 for an unknown aggregate.
    async fn aggregate_version(
        &self,
        aggregate_type: &str,
        aggregate_id: i64,
    ) -> Result<i64, EventStoreError>;
}

/// Loads filtered by aggregate type, for stores holding multiple kinds.
#[async_trait]
pub trait TypedEventStore: Send + Sync {
    async fn load_events_by_type(
        &self,
        aggregate_type: &str,
        aggregate_id: i64,
        after_version: i64,
    ) -> Result<Vec<Event>, EventStoreError>;
}

/// Paginated reads over one aggregate stream.
#[async_trait]
pub trait StreamingEventStore: Send + Sync {
    async fn stream_aggregate(
        &self,
        options: &StreamOptions,
    ) -> Result<Vec<Event>, EventStoreError>;
}

/// Check the append preconditions shared by every implementation:
/// well-formed envelopes addressed to this aggregate, with versions
/// forming the sequence right after `expected_version`.
pub(crate) fn validate_batch(
    aggregate_id: i64,
    events: &[Event],
    expected_version: i64,
) -> Result<(), EventStoreError> {
    for (i, event) in events.iter().enumerate() {
        event
            .validate()
            .map_err(|e| EventStoreError::InvalidEventData(e.to_string()))?;

        if event.aggregate_id != aggregate_id {
            return Err(EventStoreError::InvalidEventData(format!(
                "event {} addressed to aggregate {}, appending to {}",
                event.id, event.aggregate_id, aggregate_id
            )));
        }

        let expected = expected_version + i as i64 + 1;
        if event.version != expected {
            return Err(EventStoreError::InvalidVersion {
                aggregate_id,
                expected,
                actual: event.version,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(version: i64) -> Event {
        Event::new(
            format!("evt-{version}"),
            "Something",
            1,
            "Thing",
            version,
            serde_json::json!({}),
        )
    }

    #[test]
    fn test_validate_batch_accepts_contiguous_sequence() {
        let events = vec![event(3), event(4), event(5)];
        assert!(validate_batch(1, &events, 2).is_ok());
    }

    #[test]
    fn test_validate_batch_rejects_gap() {
        let events = vec![event(3), event(5)];
        let err = validate_batch(1, &events, 2).unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::InvalidVersion {
                expected: 4,
                actual: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_validate_batch_rejects_wrong_aggregate() {
        let mut stray = event(1);
        stray.aggregate_id = 99;
        let err = validate_batch(1, &[stray], 0).unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidEventData(_)));
    }
}
