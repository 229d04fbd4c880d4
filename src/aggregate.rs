//! Aggregate module
//!
//! Aggregate Root pattern implementation for Event Sourcing. Domain
//! state is derived from events, never directly mutated; the root tracks
//! identity, version, and the uncommitted-event buffer.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Behavior an event-sourced aggregate state must implement.
///
/// Implementations mutate business state only; the version is owned by
/// [`AggregateRoot`], which wraps the state.
pub trait Aggregate: Default + Send + Sync {
    /// The type of events this aggregate handles
    type Event: Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync;

    /// Error returned when an event is rejected by the aggregate
    type Error: std::error::Error + Send + Sync + 'static;

    /// Get the aggregate type name (for storage)
    fn aggregate_type() -> &'static str;

    /// Get the domain event name used in the persisted envelope
    fn event_type(event: &Self::Event) -> &'static str;

    /// Apply an event to update the aggregate state
    fn apply(&mut self, event: &Self::Event) -> Result<(), Self::Error>;

    /// Schema revision stamped on new envelopes
    fn schema_version() -> i32 {
        1
    }
}

/// Root wrapping an aggregate state with identity, version, and the
/// uncommitted-event buffer.
///
/// A root is not meant to be shared across tasks while being mutated;
/// services hold it exclusively for the lifetime of one command.
#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate> {
    id: i64,
    version: i64,
    state: A,
    uncommitted: Vec<A::Event>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Factory: an empty aggregate at version 0.
    pub fn new(id: i64) -> Self {
        Self {
            id,
            version: 0,
            state: A::default(),
            uncommitted: Vec::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Version of the last applied event (0 for a fresh aggregate).
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn aggregate_type(&self) -> &'static str {
        A::aggregate_type()
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut A {
        &mut self.state
    }

    pub(crate) fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    /// Apply an event to the state and advance the version.
    ///
    /// This is the only place the version moves; the rebuild path calls
    /// it once per stored event.
    pub fn apply(&mut self, event: &A::Event) -> Result<(), A::Error> {
        self.state.apply(event)?;
        self.version += 1;
        Ok(())
    }

    /// Apply an event and record it in the uncommitted buffer.
    ///
    /// Nothing is recorded when the state rejects the event.
    pub fn apply_and_record(&mut self, event: A::Event) -> Result<(), A::Error> {
        self.apply(&event)?;
        self.uncommitted.push(event);
        Ok(())
    }

    /// Append to the uncommitted buffer without touching state or version.
    pub fn record(&mut self, event: A::Event) {
        self.uncommitted.push(event);
    }

    /// Defensive copy of the uncommitted buffer.
    pub fn uncommitted_events(&self) -> Vec<A::Event> {
        self.uncommitted.clone()
    }

    pub fn has_uncommitted_events(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Version of the last event already persisted.
    pub fn committed_version(&self) -> i64 {
        self.version - self.uncommitted.len() as i64
    }

    /// Empty the buffer after a successful save; the version is untouched.
    pub fn mark_committed(&mut self) {
        self.uncommitted.clear();
    }
}

/// Snapshot serialization hooks for an aggregate state.
///
/// The defaults serialize the full state. Override `snapshot_data` to
/// persist a lighter projection, and `restore_from_snapshot` to hydrate
/// from it.
pub trait SnapshotData: Serialize + DeserializeOwned {
    fn snapshot_data(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn restore_from_snapshot(&mut self, data: serde_json::Value) -> Result<(), serde_json::Error> {
        *self = serde_json::from_value(data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Counter {
        total: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum CounterEvent {
        Added(i64),
        Reset,
    }

    #[derive(Debug, thiserror::Error)]
    enum CounterError {
        #[error("cannot add a negative amount")]
        Negative,
    }

    impl Aggregate for Counter {
        type Event = CounterEvent;
        type Error = CounterError;

        fn aggregate_type() -> &'static str {
            "Counter"
        }

        fn event_type(event: &Self::Event) -> &'static str {
            match event {
                CounterEvent::Added(_) => "Added",
                CounterEvent::Reset => "Reset",
            }
        }

        fn apply(&mut self, event: &Self::Event) -> Result<(), Self::Error> {
            match event {
                CounterEvent::Added(n) if *n < 0 => return Err(CounterError::Negative),
                CounterEvent::Added(n) => self.total += n,
                CounterEvent::Reset => self.total = 0,
            }
            Ok(())
        }
    }

    impl SnapshotData for Counter {}

    #[test]
    fn test_new_root_is_empty() {
        let root = AggregateRoot::<Counter>::new(7);
        assert_eq!(root.id(), 7);
        assert_eq!(root.version(), 0);
        assert_eq!(root.committed_version(), 0);
        assert!(!root.has_uncommitted_events());
    }

    #[test]
    fn test_apply_and_record_advances_version_and_buffers() {
        let mut root = AggregateRoot::<Counter>::new(1);
        root.apply_and_record(CounterEvent::Added(3)).unwrap();
        root.apply_and_record(CounterEvent::Added(4)).unwrap();

        assert_eq!(root.version(), 2);
        assert_eq!(root.state().total, 7);
        assert_eq!(root.uncommitted_events().len(), 2);
        assert_eq!(root.committed_version(), 0);
    }

    #[test]
    fn test_rejected_event_is_not_recorded() {
        let mut root = AggregateRoot::<Counter>::new(1);
        let result = root.apply_and_record(CounterEvent::Added(-1));

        assert!(result.is_err());
        assert_eq!(root.version(), 0);
        assert!(!root.has_uncommitted_events());
    }

    #[test]
    fn test_mark_committed_clears_buffer_keeps_version() {
        let mut root = AggregateRoot::<Counter>::new(1);
        root.apply_and_record(CounterEvent::Added(1)).unwrap();
        root.mark_committed();

        assert_eq!(root.version(), 1);
        assert_eq!(root.committed_version(), 1);
        assert!(!root.has_uncommitted_events());
    }

    #[test]
    fn test_rebuild_path_apply_does_not_buffer() {
        let mut root = AggregateRoot::<Counter>::new(1);
        root.apply(&CounterEvent::Added(5)).unwrap();
        root.apply(&CounterEvent::Reset).unwrap();

        assert_eq!(root.version(), 2);
        assert_eq!(root.state().total, 0);
        assert!(!root.has_uncommitted_events());
    }

    #[test]
    fn test_snapshot_data_round_trip() {
        let state = Counter { total: 9 };
        let data = state.snapshot_data().unwrap();

        let mut restored = Counter::default();
        restored.restore_from_snapshot(data).unwrap();
        assert_eq!(restored.total, 9);
    }
}
