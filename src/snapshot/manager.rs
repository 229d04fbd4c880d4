//! Snapshot manager
//!
//! Orchestrates strategy decisions, serialization, and store access, and
//! keeps process-wide counters of snapshot activity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::aggregate::{Aggregate, AggregateRoot, SnapshotData};
use crate::config::SnapshotConfig;

use super::{Snapshot, SnapshotError, SnapshotStore, SnapshotStrategy};

/// Process-wide snapshot counters.
#[derive(Debug)]
pub struct SnapshotMetrics {
    created: AtomicU64,
    loads_succeeded: AtomicU64,
    loads_failed: AtomicU64,
    load_micros_total: AtomicU64,
}

impl SnapshotMetrics {
    const fn new() -> Self {
        Self {
            created: AtomicU64::new(0),
            loads_succeeded: AtomicU64::new(0),
            loads_failed: AtomicU64::new(0),
            load_micros_total: AtomicU64::new(0),
        }
    }

    fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_load(&self, success: bool, elapsed: Duration) {
        if success {
            self.loads_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.loads_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.load_micros_total
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn loads_succeeded(&self) -> u64 {
        self.loads_succeeded.load(Ordering::Relaxed)
    }

    pub fn loads_failed(&self) -> u64 {
        self.loads_failed.load(Ordering::Relaxed)
    }

    /// Mean load latency over all attempts so far.
    pub fn avg_load_latency(&self) -> Duration {
        let attempts = self.loads_succeeded() + self.loads_failed();
        if attempts == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.load_micros_total.load(Ordering::Relaxed) / attempts)
    }
}

static METRICS: SnapshotMetrics = SnapshotMetrics::new();

/// Process-wide snapshot counters shared by all managers.
pub fn global_metrics() -> &'static SnapshotMetrics {
    &METRICS
}

/// Orchestrates snapshot creation and loading for aggregate roots.
pub struct SnapshotManager {
    store: Arc<dyn SnapshotStore>,
    strategy: Arc<dyn SnapshotStrategy>,
    config: SnapshotConfig,
}

impl SnapshotManager {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        strategy: Arc<dyn SnapshotStrategy>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            store,
            strategy,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Decide whether to snapshot this aggregate now.
    ///
    /// Combines the strategy decision with a delta guard: with a prior
    /// snapshot at version `Vs`, at least `config.frequency` more events
    /// must have accumulated.
    pub async fn should_create_snapshot<A: Aggregate>(&self, root: &AggregateRoot<A>) -> bool {
        if !self.config.enabled {
            return false;
        }
        if !self
            .strategy
            .should_snapshot(A::aggregate_type(), root.id(), root.version())
            .await
        {
            return false;
        }

        match self.store.get(A::aggregate_type(), root.id()).await {
            Ok(Some(previous)) => root.version() >= previous.version + self.config.frequency,
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(
                    aggregate_type = A::aggregate_type(),
                    aggregate_id = root.id(),
                    error = %e,
                    "snapshot lookup failed; skipping snapshot"
                );
                false
            }
        }
    }

    /// Serialize and persist a checkpoint of the aggregate.
    pub async fn create_snapshot<A>(&self, root: &AggregateRoot<A>) -> Result<Snapshot, SnapshotError>
    where
        A: Aggregate + SnapshotData,
    {
        if !self.config.enabled {
            return Err(SnapshotError::Disabled);
        }

        let data = root.state().snapshot_data()?;
        let data_size = data.to_string().len();

        let mut snapshot = Snapshot {
            aggregate_type: A::aggregate_type().to_string(),
            aggregate_id: root.id(),
            version: root.version(),
            data,
            timestamp: Utc::now(),
            metadata: Default::default(),
        };
        snapshot.metadata.insert(
            "created_by".to_string(),
            serde_json::json!("snapshot_manager"),
        );
        snapshot
            .metadata
            .insert("data_size".to_string(), serde_json::json!(data_size));

        self.store.save(&snapshot).await?;
        METRICS.record_created();

        tracing::info!(
            aggregate_type = A::aggregate_type(),
            aggregate_id = root.id(),
            version = root.version(),
            data_size,
            "snapshot created"
        );

        Ok(snapshot)
    }

    /// Hydrate an aggregate root from its latest snapshot.
    pub async fn load_snapshot<A>(
        &self,
        aggregate_id: i64,
        root: &mut AggregateRoot<A>,
    ) -> Result<Snapshot, SnapshotError>
    where
        A: Aggregate + SnapshotData,
    {
        if !self.config.enabled {
            return Err(SnapshotError::Disabled);
        }

        let started = Instant::now();
        let result = self.try_load(aggregate_id, root).await;
        METRICS.record_load(result.is_ok(), started.elapsed());
        result
    }

    async fn try_load<A>(
        &self,
        aggregate_id: i64,
        root: &mut AggregateRoot<A>,
    ) -> Result<Snapshot, SnapshotError>
    where
        A: Aggregate + SnapshotData,
    {
        let snapshot = self
            .store
            .get(A::aggregate_type(), aggregate_id)
            .await?
            .ok_or_else(|| SnapshotError::NotFound {
                aggregate_type: A::aggregate_type().to_string(),
                aggregate_id,
            })?;

        root.state_mut().restore_from_snapshot(snapshot.data.clone())?;
        root.set_version(snapshot.version);

        tracing::debug!(
            aggregate_type = A::aggregate_type(),
            aggregate_id,
            version = snapshot.version,
            "aggregate hydrated from snapshot"
        );

        Ok(snapshot)
    }

    /// Delete snapshots older than the configured retention.
    pub async fn cleanup_old_snapshots(&self) -> Result<u64, SnapshotError> {
        self.store.cleanup(self.config.retention).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{EventCountStrategy, InMemorySnapshotStore};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Tally {
        total: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Bumped;

    impl Aggregate for Tally {
        type Event = Bumped;
        type Error = std::convert::Infallible;

        fn aggregate_type() -> &'static str {
            "Tally"
        }

        fn event_type(_: &Self::Event) -> &'static str {
            "Bumped"
        }

        fn apply(&mut self, _: &Self::Event) -> Result<(), Self::Error> {
            self.total += 1;
            Ok(())
        }
    }

    impl SnapshotData for Tally {}

    fn manager(frequency: i64, enabled: bool) -> SnapshotManager {
        SnapshotManager::new(
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(EventCountStrategy::new(1)),
            SnapshotConfig {
                enabled,
                frequency,
                retention: Duration::from_secs(3600),
            },
        )
    }

    fn root_at_version(id: i64, version: i64) -> AggregateRoot<Tally> {
        let mut root = AggregateRoot::new(id);
        for _ in 0..version {
            root.apply(&Bumped).unwrap();
        }
        root
    }

    #[tokio::test]
    async fn test_disabled_manager_never_snapshots() {
        let manager = manager(1, false);
        let root = root_at_version(1, 10);
        assert!(!manager.should_create_snapshot(&root).await);
        assert!(matches!(
            manager.create_snapshot(&root).await,
            Err(SnapshotError::Disabled)
        ));
    }

    #[tokio::test]
    async fn test_delta_guard_requires_frequency_gap() {
        let manager = manager(3, true);
        let root = root_at_version(1, 5);

        assert!(manager.should_create_snapshot(&root).await);
        manager.create_snapshot(&root).await.unwrap();

        // Two more events: below the delta guard.
        let root = root_at_version(1, 7);
        assert!(!manager.should_create_snapshot(&root).await);

        // Three more events: guard satisfied again.
        let root = root_at_version(1, 8);
        assert!(manager.should_create_snapshot(&root).await);
    }

    #[tokio::test]
    async fn test_create_and_load_round_trip() {
        let manager = manager(1, true);
        let root = root_at_version(7, 4);

        let snapshot = manager.create_snapshot(&root).await.unwrap();
        assert_eq!(snapshot.version, 4);
        assert_eq!(
            snapshot.metadata.get("created_by").and_then(|v| v.as_str()),
            Some("snapshot_manager")
        );
        assert!(snapshot.metadata.contains_key("data_size"));

        let mut hydrated = AggregateRoot::<Tally>::new(7);
        let loaded = manager.load_snapshot(7, &mut hydrated).await.unwrap();
        assert_eq!(loaded.version, 4);
        assert_eq!(hydrated.version(), 4);
        assert_eq!(hydrated.state().total, 4);
    }

    #[tokio::test]
    async fn test_load_missing_snapshot_is_not_found() {
        let manager = manager(1, true);
        let mut root = AggregateRoot::<Tally>::new(9);
        let err = manager.load_snapshot(9, &mut root).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(root.version(), 0);
    }

    #[tokio::test]
    async fn test_metrics_accumulate() {
        let manager = manager(1, true);
        let root = root_at_version(11, 2);

        let before_created = global_metrics().created();
        manager.create_snapshot(&root).await.unwrap();
        assert_eq!(global_metrics().created(), before_created + 1);

        let before_ok = global_metrics().loads_succeeded();
        let mut hydrated = AggregateRoot::<Tally>::new(11);
        manager.load_snapshot(11, &mut hydrated).await.unwrap();
        assert_eq!(global_metrics().loads_succeeded(), before_ok + 1);

        let before_failed = global_metrics().loads_failed();
        let mut missing = AggregateRoot::<Tally>::new(999);
        let _ = manager.load_snapshot(999, &mut missing).await;
        assert_eq!(global_metrics().loads_failed(), before_failed + 1);
    }
}
