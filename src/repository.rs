//! Repository adapter
//!
//! The single persistence surface the domain relies on: append with
//! optimistic concurrency, rebuild (optionally snapshot-accelerated),
//! and either transactional-outbox or direct-bus publication.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::aggregate::{Aggregate, AggregateRoot, SnapshotData};
use crate::bus::EventBus;
use crate::error::{CoreError, CoreResult};
use crate::event::{Event, EventUpgrader, IdGenerator, UuidIdGenerator};
use crate::event_store::{EventStore, EventStoreError};
use crate::outbox::OutboxRepository;
use crate::snapshot::SnapshotManager;

/// Builder for [`AggregateRepository`].
pub struct RepositoryBuilder<A: Aggregate> {
    event_store: Option<Arc<dyn EventStore>>,
    snapshot_manager: Option<Arc<SnapshotManager>>,
    event_bus: Option<Arc<dyn EventBus>>,
    outbox: Option<Arc<dyn OutboxRepository>>,
    publish_events: bool,
    allow_direct_publish: bool,
    id_generator: Arc<dyn IdGenerator>,
    upgrader: Option<Arc<dyn EventUpgrader>>,
    _marker: PhantomData<A>,
}

impl<A: Aggregate + SnapshotData> Default for RepositoryBuilder<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate + SnapshotData> RepositoryBuilder<A> {
    pub fn new() -> Self {
        Self {
            event_store: None,
            snapshot_manager: None,
            event_bus: None,
            outbox: None,
            publish_events: false,
            allow_direct_publish: false,
            id_generator: Arc::new(UuidIdGenerator),
            upgrader: None,
            _marker: PhantomData,
        }
    }

    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(store);
        self
    }

    pub fn snapshot_manager(mut self, manager: Arc<SnapshotManager>) -> Self {
        self.snapshot_manager = Some(manager);
        self
    }

    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn outbox_repository(mut self, outbox: Arc<dyn OutboxRepository>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Publish appended events to the bus. With an outbox configured the
    /// background publisher does this instead.
    pub fn publish_events(mut self, publish: bool) -> Self {
        self.publish_events = publish;
        self
    }

    /// Acknowledge that publishing straight to the bus, without an
    /// outbox, is not atomic with persistence. Without this flag that
    /// configuration is refused at build time.
    pub fn allow_direct_publish(mut self, allow: bool) -> Self {
        self.allow_direct_publish = allow;
        self
    }

    pub fn id_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = generator;
        self
    }

    pub fn event_upgrader(mut self, upgrader: Arc<dyn EventUpgrader>) -> Self {
        self.upgrader = Some(upgrader);
        self
    }

    pub fn build(self) -> CoreResult<AggregateRepository<A>> {
        if A::aggregate_type().is_empty() {
            return Err(CoreError::InvalidConfiguration(
                "aggregate type must not be empty".to_string(),
            ));
        }
        let event_store = self.event_store.ok_or_else(|| {
            CoreError::InvalidConfiguration("an event store is required".to_string())
        })?;

        if self.publish_events && self.event_bus.is_some() && self.outbox.is_none() {
            if !self.allow_direct_publish {
                return Err(CoreError::InvalidConfiguration(
                    "direct bus publication without an outbox is not atomic; \
                     configure an outbox repository or opt in with allow_direct_publish"
                        .to_string(),
                ));
            }
            tracing::warn!(
                aggregate_type = A::aggregate_type(),
                "publishing directly to the event bus without an outbox; \
                 events can be persisted yet never published"
            );
        }

        Ok(AggregateRepository {
            event_store,
            snapshots: self.snapshot_manager,
            bus: self.event_bus,
            outbox: self.outbox,
            publish_events: self.publish_events,
            ids: self.id_generator,
            upgrader: self.upgrader,
            _marker: PhantomData,
        })
    }
}

/// Event-sourced repository for one aggregate type.
///
/// Stateless apart from its collaborators, so it can be shared freely
/// behind an `Arc`.
pub struct AggregateRepository<A: Aggregate> {
    event_store: Arc<dyn EventStore>,
    snapshots: Option<Arc<SnapshotManager>>,
    bus: Option<Arc<dyn EventBus>>,
    outbox: Option<Arc<dyn OutboxRepository>>,
    publish_events: bool,
    ids: Arc<dyn IdGenerator>,
    upgrader: Option<Arc<dyn EventUpgrader>>,
    _marker: PhantomData<A>,
}

impl<A: Aggregate> std::fmt::Debug for AggregateRepository<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRepository")
            .field("publish_events", &self.publish_events)
            .field("has_snapshots", &self.snapshots.is_some())
            .field("has_bus", &self.bus.is_some())
            .field("has_outbox", &self.outbox.is_some())
            .field("has_upgrader", &self.upgrader.is_some())
            .finish()
    }
}

impl<A: Aggregate + SnapshotData> AggregateRepository<A> {
    pub fn builder() -> RepositoryBuilder<A> {
        RepositoryBuilder::new()
    }

    /// Append domain events at `expected_version`, publishing through
    /// the outbox when one is configured.
    pub async fn append_events(
        &self,
        aggregate_id: i64,
        events: &[A::Event],
        expected_version: i64,
    ) -> CoreResult<()> {
        self.append_events_with_metadata(aggregate_id, events, expected_version, &HashMap::new())
            .await
    }

    /// Append with extra envelope metadata (actor, command type, ...).
    pub async fn append_events_with_metadata(
        &self,
        aggregate_id: i64,
        events: &[A::Event],
        expected_version: i64,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> CoreResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        if aggregate_id <= 0 {
            return Err(CoreError::InvalidId(aggregate_id.to_string()));
        }

        let mut envelopes = Vec::with_capacity(events.len());
        for (i, event) in events.iter().enumerate() {
            let event_type = A::event_type(event);
            if event_type.is_empty() {
                return Err(CoreError::Validation(
                    "domain event has an empty type".to_string(),
                ));
            }
            let payload = serde_json::to_value(event).map_err(|e| {
                CoreError::RepositoryFailed(format!("serialize {event_type} payload: {e}"))
            })?;

            let mut envelope = Event::new(
                self.ids.next_id(),
                event_type,
                aggregate_id,
                A::aggregate_type(),
                expected_version + i as i64 + 1,
                payload,
            );
            envelope.schema_version = A::schema_version();
            envelope.metadata = metadata.clone();
            envelope
                .metadata
                .insert("event_sourced".to_string(), serde_json::json!(true));
            envelope
                .validate()
                .map_err(|e| CoreError::Validation(e.to_string()))?;
            envelopes.push(envelope);
        }

        if let Some(outbox) = &self.outbox {
            outbox.save_with_events(aggregate_id, &envelopes).await?;
            return Ok(());
        }

        self.event_store
            .append_events(aggregate_id, &envelopes, expected_version)
            .await?;

        if self.publish_events {
            if let Some(bus) = &self.bus {
                if let Err(e) = bus.publish_events(&envelopes).await {
                    // The events are persisted; only their publication
                    // failed.
                    return Err(CoreError::Dependency(format!(
                        "event publish failed after append: {e}"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Rebuild an aggregate root from its snapshot (when available) and
    /// the tail of its event stream. Returns the final version.
    pub async fn restore_aggregate(&self, root: &mut AggregateRoot<A>) -> CoreResult<i64> {
        let mut from_version = 0i64;
        if let Some(manager) = &self.snapshots {
            match manager.load_snapshot(root.id(), root).await {
                Ok(snapshot) => {
                    from_version = snapshot.version;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(
                        aggregate_type = A::aggregate_type(),
                        aggregate_id = root.id(),
                        error = %e,
                        "snapshot load failed; replaying full stream"
                    );
                }
            }
        }

        let loaded = match self.event_store.as_typed() {
            Some(typed) => {
                typed
                    .load_events_by_type(A::aggregate_type(), root.id(), from_version)
                    .await
            }
            None => self.event_store.load_events(root.id(), from_version).await,
        };
        let events = match loaded {
            Ok(events) => events,
            Err(EventStoreError::AggregateNotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut final_version = from_version;
        for mut envelope in events {
            if let Some(upgrader) = &self.upgrader {
                if let Err(e) = upgrader.upgrade(&mut envelope).await {
                    tracing::warn!(
                        event_id = %envelope.id,
                        schema_version = envelope.schema_version,
                        error = %e,
                        "event upgrade failed; applying original payload"
                    );
                }
            }

            let domain: A::Event = serde_json::from_value(envelope.payload.clone())
                .map_err(|e| {
                    CoreError::RepositoryFailed(format!(
                        "decode payload of event {}: {e}",
                        envelope.id
                    ))
                })?;
            root.apply(&domain).map_err(|e| {
                CoreError::RepositoryFailed(format!("apply event {}: {e}", envelope.id))
            })?;
            final_version = envelope.version;
        }

        root.mark_committed();
        Ok(final_version)
    }

    /// Load an aggregate by id; unknown ids yield an empty root at
    /// version 0.
    pub async fn get_by_id(&self, aggregate_id: i64) -> CoreResult<AggregateRoot<A>> {
        if aggregate_id <= 0 {
            return Err(CoreError::InvalidId(aggregate_id.to_string()));
        }
        let mut root = AggregateRoot::new(aggregate_id);
        self.restore_aggregate(&mut root).await?;
        Ok(root)
    }

    /// Persist the uncommitted buffer, then consider a snapshot.
    pub async fn save(&self, root: &mut AggregateRoot<A>) -> CoreResult<()> {
        self.save_with_metadata(root, &HashMap::new()).await
    }

    /// Persist with extra envelope metadata.
    pub async fn save_with_metadata(
        &self,
        root: &mut AggregateRoot<A>,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> CoreResult<()> {
        let events = root.uncommitted_events();
        if events.is_empty() {
            return Ok(());
        }

        self.append_events_with_metadata(root.id(), &events, root.committed_version(), metadata)
            .await?;
        root.mark_committed();

        if let Some(manager) = &self.snapshots {
            if manager.should_create_snapshot(root).await {
                if let Err(e) = manager.create_snapshot(root).await {
                    // Snapshots are a cache; failing to write one never
                    // fails the save.
                    tracing::warn!(
                        aggregate_type = A::aggregate_type(),
                        aggregate_id = root.id(),
                        error = %e,
                        "snapshot creation failed"
                    );
                }
            }
        }

        Ok(())
    }

    /// Check stream existence, preferring the inspector capability over
    /// a full load.
    pub async fn exists(&self, aggregate_id: i64) -> CoreResult<bool> {
        if let Some(inspector) = self.event_store.as_inspector() {
            return Ok(inspector
                .has_aggregate(A::aggregate_type(), aggregate_id)
                .await?);
        }
        Ok(!self.load_all(aggregate_id).await?.is_empty())
    }

    /// Tail version of the stream; 0 for an unknown aggregate.
    pub async fn aggregate_version(&self, aggregate_id: i64) -> CoreResult<i64> {
        if let Some(inspector) = self.event_store.as_inspector() {
            return Ok(inspector
                .aggregate_version(A::aggregate_type(), aggregate_id)
                .await?);
        }
        Ok(self
            .load_all(aggregate_id)
            .await?
            .last()
            .map(|e| e.version)
            .unwrap_or(0))
    }

    /// Every envelope of the stream, in version order.
    pub async fn event_history(&self, aggregate_id: i64) -> CoreResult<Vec<Event>> {
        self.load_all(aggregate_id).await
    }

    async fn load_all(&self, aggregate_id: i64) -> CoreResult<Vec<Event>> {
        match self.event_store.load_events(aggregate_id, 0).await {
            Ok(events) => Ok(events),
            Err(EventStoreError::AggregateNotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use crate::event_store::InMemoryEventStore;
    use crate::outbox::InMemoryOutboxRepository;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Tally {
        total: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Bumped {
        by: i64,
    }

    impl Aggregate for Tally {
        type Event = Bumped;
        type Error = std::convert::Infallible;

        fn aggregate_type() -> &'static str {
            "Tally"
        }

        fn event_type(_: &Self::Event) -> &'static str {
            "Bumped"
        }

        fn apply(&mut self, event: &Self::Event) -> Result<(), Self::Error> {
            self.total += event.by;
            Ok(())
        }
    }

    impl SnapshotData for Tally {}

    #[test]
    fn test_build_requires_event_store() {
        let err = RepositoryBuilder::<Tally>::new().build().unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIGURATION");
    }

    #[test]
    fn test_build_refuses_direct_publish_without_outbox() {
        let err = RepositoryBuilder::<Tally>::new()
            .event_store(Arc::new(InMemoryEventStore::new()))
            .event_bus(Arc::new(InMemoryEventBus::new()))
            .publish_events(true)
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIGURATION");
    }

    #[test]
    fn test_build_allows_direct_publish_when_acknowledged() {
        let repo = RepositoryBuilder::<Tally>::new()
            .event_store(Arc::new(InMemoryEventStore::new()))
            .event_bus(Arc::new(InMemoryEventBus::new()))
            .publish_events(true)
            .allow_direct_publish(true)
            .build();
        assert!(repo.is_ok());
    }

    #[test]
    fn test_build_accepts_bus_with_outbox() {
        let store = Arc::new(InMemoryEventStore::new());
        let repo = RepositoryBuilder::<Tally>::new()
            .event_store(store.clone())
            .event_bus(Arc::new(InMemoryEventBus::new()))
            .outbox_repository(Arc::new(InMemoryOutboxRepository::new(store)))
            .publish_events(true)
            .build();
        assert!(repo.is_ok());
    }

    #[tokio::test]
    async fn test_append_empty_batch_is_noop() {
        let repo = RepositoryBuilder::<Tally>::new()
            .event_store(Arc::new(InMemoryEventStore::new()))
            .build()
            .unwrap();
        repo.append_events(1, &[], 0).await.unwrap();
        assert!(!repo.exists(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_append_rejects_bad_aggregate_id() {
        let repo = RepositoryBuilder::<Tally>::new()
            .event_store(Arc::new(InMemoryEventStore::new()))
            .build()
            .unwrap();
        let err = repo
            .append_events(0, &[Bumped { by: 1 }], 0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ID");
    }

    #[tokio::test]
    async fn test_save_and_reload_round_trip() {
        let repo = RepositoryBuilder::<Tally>::new()
            .event_store(Arc::new(InMemoryEventStore::new()))
            .build()
            .unwrap();

        let mut root = AggregateRoot::<Tally>::new(5);
        root.apply_and_record(Bumped { by: 2 }).unwrap();
        root.apply_and_record(Bumped { by: 3 }).unwrap();
        repo.save(&mut root).await.unwrap();
        assert!(!root.has_uncommitted_events());

        let reloaded = repo.get_by_id(5).await.unwrap();
        assert_eq!(reloaded.version(), 2);
        assert_eq!(reloaded.state().total, 5);

        assert!(repo.exists(5).await.unwrap());
        assert_eq!(repo.aggregate_version(5).await.unwrap(), 2);

        let history = repo.event_history(5).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history
            .iter()
            .all(|e| e.metadata.get("event_sourced") == Some(&serde_json::json!(true))));
    }

    #[tokio::test]
    async fn test_unknown_aggregate_loads_empty_root() {
        let repo = RepositoryBuilder::<Tally>::new()
            .event_store(Arc::new(InMemoryEventStore::new()))
            .build()
            .unwrap();

        let root = repo.get_by_id(99).await.unwrap();
        assert_eq!(root.version(), 0);
        assert!(!repo.exists(99).await.unwrap());
        assert_eq!(repo.aggregate_version(99).await.unwrap(), 0);
        assert!(repo.event_history(99).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_save_surfaces_version_conflict() {
        let store = Arc::new(InMemoryEventStore::new());
        let repo = RepositoryBuilder::<Tally>::new()
            .event_store(store)
            .build()
            .unwrap();

        let mut seed = AggregateRoot::<Tally>::new(1);
        seed.apply_and_record(Bumped { by: 1 }).unwrap();
        repo.save(&mut seed).await.unwrap();

        let mut a = repo.get_by_id(1).await.unwrap();
        let mut b = repo.get_by_id(1).await.unwrap();

        a.apply_and_record(Bumped { by: 10 }).unwrap();
        repo.save(&mut a).await.unwrap();

        b.apply_and_record(Bumped { by: 20 }).unwrap();
        let err = repo.save(&mut b).await.unwrap_err();
        assert!(err.is_version_conflict());

        // The loser's event was not persisted.
        assert_eq!(repo.aggregate_version(1).await.unwrap(), 2);
        let reloaded = repo.get_by_id(1).await.unwrap();
        assert_eq!(reloaded.state().total, 11);
    }

    struct BumpUpgrader;

    #[async_trait::async_trait]
    impl EventUpgrader for BumpUpgrader {
        async fn upgrade(&self, event: &mut Event) -> Result<(), serde_json::Error> {
            if event.schema_version < 2 {
                // v1 payloads used an "amount" field
                if let Some(amount) = event.payload.get("amount").cloned() {
                    event.payload = serde_json::json!({ "by": amount });
                    event.schema_version = 2;
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_upgrader_runs_during_restore() {
        let store = Arc::new(InMemoryEventStore::new());
        let legacy = Event::new(
            "evt-legacy",
            "Bumped",
            3,
            "Tally",
            1,
            serde_json::json!({"amount": 8}),
        );
        use crate::event_store::EventStore;
        store.append_events(3, &[legacy], 0).await.unwrap();

        let repo = RepositoryBuilder::<Tally>::new()
            .event_store(store)
            .event_upgrader(Arc::new(BumpUpgrader))
            .build()
            .unwrap();

        let root = repo.get_by_id(3).await.unwrap();
        assert_eq!(root.state().total, 8);
        assert_eq!(root.version(), 1);
    }

    #[tokio::test]
    async fn test_outbox_mode_routes_through_outbox() {
        let store = Arc::new(InMemoryEventStore::new());
        let outbox = Arc::new(InMemoryOutboxRepository::new(store.clone()));
        let repo = RepositoryBuilder::<Tally>::new()
            .event_store(store)
            .outbox_repository(outbox.clone())
            .build()
            .unwrap();

        let mut root = AggregateRoot::<Tally>::new(1);
        root.apply_and_record(Bumped { by: 1 }).unwrap();
        repo.save(&mut root).await.unwrap();

        assert_eq!(outbox.entries().len(), 1);
        assert_eq!(repo.aggregate_version(1).await.unwrap(), 1);
    }
}
