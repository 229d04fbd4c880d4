//! Outbox module
//!
//! Transactional outbox: events are persisted together with pending
//! outbox rows in one transaction, and a background publisher delivers
//! them to the event bus with retry, dead-lettering, and cleanup.

pub mod dlq;
pub mod memory;
pub mod postgres;
pub mod publisher;
mod repository;

pub use dlq::{DlqEntry, DlqPolicy, DlqRepository, InMemoryDlqRepository, PostgresDlqRepository};
pub use memory::InMemoryOutboxRepository;
pub use postgres::PostgresOutboxRepository;
pub use publisher::{OutboxPublisher, ParallelOutboxPublisher};
pub use repository::{FailedMark, OutboxRepository};

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::event::Event;
use crate::event_store::EventStoreError;

/// Outbox entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl From<String> for OutboxStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "published" => OutboxStatus::Published,
            "failed" => OutboxStatus::Failed,
            _ => OutboxStatus::Pending,
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Row of the `event_outbox` table mirroring one appended event.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// Storage-assigned id (0 until persisted)
    pub id: i64,
    pub aggregate_id: i64,
    pub aggregate_type: String,
    pub event_id: String,
    pub event_type: String,
    /// Full serialized envelope, metadata included
    pub event_data: String,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Build a pending entry carrying the full envelope.
    pub fn from_event(event: &Event) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: 0,
            aggregate_id: event.aggregate_id,
            aggregate_type: event.aggregate_type.clone(),
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            event_data: serde_json::to_string(event)?,
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            published_at: None,
            retry_count: 0,
            last_error: None,
            next_retry_at: None,
        })
    }

    /// Parse the stored envelope back out.
    pub fn to_event(&self) -> Result<Event, serde_json::Error> {
        serde_json::from_str(&self.event_data)
    }

    /// Next retry instant: `now + base * 2^retry_count`, capped at 32x
    /// the base to keep the shift bounded.
    pub fn next_retry_time(&self, base: Duration) -> DateTime<Utc> {
        let shift = self.retry_count.clamp(0, 5) as u32;
        Utc::now() + base * (1u32 << shift)
    }
}

/// Errors that can occur in the outbox subsystem
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Failed to begin transaction: {0}")]
    TxBegin(#[source] sqlx::Error),

    #[error("Failed to append events: {0}")]
    AppendEvents(#[source] EventStoreError),

    #[error("Failed to save outbox entries: {0}")]
    Save(#[source] sqlx::Error),

    #[error("Failed to commit transaction: {0}")]
    TxCommit(#[source] sqlx::Error),

    #[error("Failed to mark entry {id} as published: {source}")]
    PublishUpdate {
        id: i64,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to mark entry {id} as failed: {source}")]
    MarkFailed {
        id: i64,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to delete published entries: {0}")]
    Delete(#[source] sqlx::Error),

    #[error("Outbox entry not found: {0}")]
    EntryNotFound(i64),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OutboxError {
    /// Stable code for logs and upstream error mapping.
    pub fn code(&self) -> &'static str {
        match self {
            OutboxError::TxBegin(_) => "TX_BEGIN_FAILED",
            OutboxError::AppendEvents(_) => "APPEND_EVENTS_FAILED",
            OutboxError::Save(_) => "OUTBOX_SAVE_FAILED",
            OutboxError::TxCommit(_) => "TX_COMMIT_FAILED",
            OutboxError::PublishUpdate { .. } => "OUTBOX_PUBLISH_UPDATE_FAILED",
            OutboxError::MarkFailed { .. } => "OUTBOX_MARK_FAILED",
            OutboxError::Delete(_) => "OUTBOX_DELETE_FAILED",
            OutboxError::EntryNotFound(_) => "OUTBOX_ENTRY_NOT_FOUND",
            OutboxError::Database(_) => "OUTBOX_STORAGE_FAILED",
            OutboxError::Serialization(_) => "OUTBOX_SERIALIZATION_FAILED",
        }
    }
}
