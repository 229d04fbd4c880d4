//! Event envelope
//!
//! Self-describing record that wraps a domain payload with the routing
//! and versioning metadata the stores and the publisher need.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted event envelope.
///
/// The wire form is stable across stores:
/// `{id, type, timestamp, payload, metadata, aggregate_id, aggregate_type,
/// version, schema_version}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique event id (generator-supplied)
    pub id: String,

    /// Domain event name
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event was recorded
    pub timestamp: DateTime<Utc>,

    /// Opaque domain payload
    pub payload: serde_json::Value,

    /// Correlation hints (actor_id, source, command_type, ...)
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Aggregate the event belongs to
    pub aggregate_id: i64,

    /// Label shared by all events of one aggregate kind
    pub aggregate_type: String,

    /// Sequence number within the aggregate stream, starting at 1
    pub version: i64,

    /// Payload schema revision, starting at 1
    pub schema_version: i32,
}

impl Event {
    /// Create an envelope with the current timestamp and schema version 1.
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        aggregate_id: i64,
        aggregate_type: impl Into<String>,
        version: i64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
            metadata: HashMap::new(),
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version,
            schema_version: 1,
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Read a metadata entry as a string, if present and a string.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Check the envelope invariants.
    pub fn validate(&self) -> Result<(), EventValidationError> {
        if self.id.is_empty() {
            return Err(EventValidationError::EmptyId);
        }
        if self.event_type.is_empty() {
            return Err(EventValidationError::EmptyType);
        }
        if self.aggregate_type.is_empty() {
            return Err(EventValidationError::EmptyAggregateType);
        }
        if self.aggregate_id <= 0 {
            return Err(EventValidationError::InvalidAggregateId(self.aggregate_id));
        }
        if self.version < 1 {
            return Err(EventValidationError::InvalidVersion(self.version));
        }
        if self.schema_version < 1 {
            return Err(EventValidationError::InvalidSchemaVersion(self.schema_version));
        }
        Ok(())
    }
}

/// Envelope invariant violations
#[derive(Debug, thiserror::Error)]
pub enum EventValidationError {
    #[error("event id is empty")]
    EmptyId,

    #[error("event type is empty")]
    EmptyType,

    #[error("aggregate type is empty")]
    EmptyAggregateType,

    #[error("invalid aggregate id: {0}")]
    InvalidAggregateId(i64),

    #[error("invalid event version: {0}")]
    InvalidVersion(i64),

    #[error("invalid schema version: {0}")]
    InvalidSchemaVersion(i32),
}

/// Hook run against every stored event during aggregate rebuild.
///
/// Implementations migrate old payload shapes in place, keyed off
/// `schema_version`. Failures are logged by the caller and the original
/// payload is applied unchanged.
#[async_trait]
pub trait EventUpgrader: Send + Sync {
    async fn upgrade(&self, event: &mut Event) -> Result<(), serde_json::Error>;
}

/// Source of event ids.
///
/// Injected into the repository at construction so the id scheme is a
/// boot-time decision, not a per-call one.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Default generator: random UUID v4 rendered as text.
#[derive(Debug, Clone, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}
