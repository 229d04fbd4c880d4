//! Snapshot strategies
//!
//! A strategy decides whether an aggregate should be snapshotted now.
//! The manager combines the decision with its own delta guard.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::SnapshotStore;

/// Decision point: snapshot this aggregate at this version now?
#[async_trait]
pub trait SnapshotStrategy: Send + Sync {
    async fn should_snapshot(&self, aggregate_type: &str, aggregate_id: i64, version: i64)
        -> bool;
}

/// Snapshot every `frequency` events.
#[derive(Debug, Clone)]
pub struct EventCountStrategy {
    frequency: i64,
}

impl EventCountStrategy {
    pub fn new(frequency: i64) -> Self {
        Self {
            frequency: frequency.max(1),
        }
    }
}

#[async_trait]
impl SnapshotStrategy for EventCountStrategy {
    async fn should_snapshot(&self, _: &str, _: i64, version: i64) -> bool {
        version > 0 && version % self.frequency == 0
    }
}

/// Snapshot when the last one is older than `interval` (or absent).
pub struct TimeDurationStrategy {
    interval: Duration,
    store: Arc<dyn SnapshotStore>,
}

impl TimeDurationStrategy {
    pub fn new(interval: Duration, store: Arc<dyn SnapshotStore>) -> Self {
        Self { interval, store }
    }
}

#[async_trait]
impl SnapshotStrategy for TimeDurationStrategy {
    async fn should_snapshot(&self, aggregate_type: &str, aggregate_id: i64, _: i64) -> bool {
        match self.store.get(aggregate_type, aggregate_id).await {
            Ok(None) => true,
            Ok(Some(snapshot)) => {
                let elapsed = Utc::now().signed_duration_since(snapshot.timestamp);
                elapsed.to_std().map(|e| e >= self.interval).unwrap_or(false)
            }
            Err(e) => {
                tracing::warn!(
                    aggregate_type,
                    aggregate_id,
                    error = %e,
                    "snapshot store read failed in time strategy"
                );
                false
            }
        }
    }
}

/// Estimates the serialized size of an aggregate without loading it.
pub trait SizeEstimator: Send + Sync {
    fn estimate_bytes(&self, aggregate_type: &str, aggregate_id: i64) -> u64;
}

/// Snapshot when the stream is long or the aggregate is large.
pub struct AggregateSizeStrategy {
    max_events: i64,
    max_bytes: u64,
    estimator: Option<Arc<dyn SizeEstimator>>,
}

impl AggregateSizeStrategy {
    pub fn new(max_events: i64, max_bytes: u64) -> Self {
        Self {
            max_events,
            max_bytes,
            estimator: None,
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn SizeEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }
}

#[async_trait]
impl SnapshotStrategy for AggregateSizeStrategy {
    async fn should_snapshot(&self, aggregate_type: &str, aggregate_id: i64, version: i64) -> bool {
        if version >= self.max_events {
            return true;
        }
        self.estimator
            .as_ref()
            .map(|e| e.estimate_bytes(aggregate_type, aggregate_id) >= self.max_bytes)
            .unwrap_or(false)
    }
}

/// How a composite combines its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeMode {
    Any,
    All,
}

/// Combines child strategies with Any/All semantics.
///
/// An empty composite never snapshots.
pub struct CompositeStrategy {
    mode: CompositeMode,
    children: Vec<Arc<dyn SnapshotStrategy>>,
}

impl CompositeStrategy {
    pub fn new(mode: CompositeMode, children: Vec<Arc<dyn SnapshotStrategy>>) -> Self {
        Self { mode, children }
    }
}

#[async_trait]
impl SnapshotStrategy for CompositeStrategy {
    async fn should_snapshot(&self, aggregate_type: &str, aggregate_id: i64, version: i64) -> bool {
        if self.children.is_empty() {
            return false;
        }
        for child in &self.children {
            let decision = child
                .should_snapshot(aggregate_type, aggregate_id, version)
                .await;
            match self.mode {
                CompositeMode::Any if decision => return true,
                CompositeMode::All if !decision => return false,
                _ => {}
            }
        }
        self.mode == CompositeMode::All
    }
}
