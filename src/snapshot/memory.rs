//! In-memory snapshot store

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{Snapshot, SnapshotError, SnapshotStore};

/// Map-backed snapshot store, one snapshot per aggregate (latest wins).
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<(String, i64), Snapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let mut snapshots = self.snapshots.write().expect("snapshot store lock poisoned");
        snapshots.insert(
            (snapshot.aggregate_type.clone(), snapshot.aggregate_id),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn get(
        &self,
        aggregate_type: &str,
        aggregate_id: i64,
    ) -> Result<Option<Snapshot>, SnapshotError> {
        let snapshots = self.snapshots.read().expect("snapshot store lock poisoned");
        Ok(snapshots
            .get(&(aggregate_type.to_string(), aggregate_id))
            .cloned())
    }

    async fn delete(&self, aggregate_type: &str, aggregate_id: i64) -> Result<(), SnapshotError> {
        let mut snapshots = self.snapshots.write().expect("snapshot store lock poisoned");
        snapshots.remove(&(aggregate_type.to_string(), aggregate_id));
        Ok(())
    }

    async fn list(&self, aggregate_type: &str, limit: i64) -> Result<Vec<Snapshot>, SnapshotError> {
        let snapshots = self.snapshots.read().expect("snapshot store lock poisoned");
        let mut matching: Vec<Snapshot> = snapshots
            .values()
            .filter(|s| s.aggregate_type == aggregate_type)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn cleanup(&self, retention: Duration) -> Result<u64, SnapshotError> {
        let cutoff = Utc::now() - retention;
        let mut snapshots = self.snapshots.write().expect("snapshot store lock poisoned");
        let before = snapshots.len();
        snapshots.retain(|_, s| s.timestamp >= cutoff);
        Ok((before - snapshots.len()) as u64)
    }
}
