//! Snapshot module
//!
//! Serialized checkpoints of aggregate state used to shorten event
//! replay. Snapshots are a cache: losing them costs rebuild time, never
//! correctness.

pub mod manager;
pub mod memory;
pub mod postgres;
pub mod strategy;

pub use manager::{global_metrics, SnapshotManager, SnapshotMetrics};
pub use memory::InMemorySnapshotStore;
pub use postgres::PostgresSnapshotStore;
pub use strategy::{
    AggregateSizeStrategy, CompositeMode, CompositeStrategy, EventCountStrategy, SizeEstimator,
    SnapshotStrategy, TimeDurationStrategy,
};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Serialized aggregate checkpoint at a known version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_type: String,
    pub aggregate_id: i64,
    pub version: i64,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Storage port for snapshots, keyed by `(aggregate_type, aggregate_id)`
/// with latest-wins semantics.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;

    async fn get(
        &self,
        aggregate_type: &str,
        aggregate_id: i64,
    ) -> Result<Option<Snapshot>, SnapshotError>;

    async fn delete(&self, aggregate_type: &str, aggregate_id: i64) -> Result<(), SnapshotError>;

    /// Snapshots of one aggregate type, newest first.
    async fn list(&self, aggregate_type: &str, limit: i64) -> Result<Vec<Snapshot>, SnapshotError>;

    /// Delete snapshots older than `retention`; returns how many went.
    async fn cleanup(&self, retention: Duration) -> Result<u64, SnapshotError>;
}

/// Errors that can occur in the snapshot subsystem
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("No snapshot for {aggregate_type} aggregate {aggregate_id}")]
    NotFound {
        aggregate_type: String,
        aggregate_id: i64,
    },

    #[error("Snapshotting is disabled")]
    Disabled,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SnapshotError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SnapshotError::NotFound { .. })
    }
}
