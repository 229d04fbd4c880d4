//! Outbox repository port
//!
//! Transactionally persists events alongside pending outbox rows and
//! manages the row lifecycle the publisher drives.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::event::Event;

use super::{OutboxEntry, OutboxError};

/// Arguments of one failed-mark in a batch.
#[derive(Debug, Clone)]
pub struct FailedMark {
    pub id: i64,
    pub error: String,
    pub next_retry_at: DateTime<Utc>,
}

/// Storage port for the transactional outbox.
///
/// The batch operations default to looping over the singular forms;
/// SQL implementations override them with set-based statements.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Append events to the event store and insert one pending outbox
    /// row per event, all within a single transaction.
    async fn save_with_events(
        &self,
        aggregate_id: i64,
        events: &[Event],
    ) -> Result<(), OutboxError>;

    /// Entries due for publishing: pending, or failed with an elapsed
    /// (or absent) retry time. Ordered by creation time ascending.
    async fn pending_entries(&self, limit: i64) -> Result<Vec<OutboxEntry>, OutboxError>;

    async fn mark_published(&self, id: i64) -> Result<(), OutboxError>;

    /// Record a failed publish attempt and schedule the retry.
    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), OutboxError>;

    /// Delete published rows older than the cutoff; returns how many.
    async fn delete_published(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxError>;

    /// Delete one entry regardless of status (DLQ migration path).
    async fn delete_entry(&self, id: i64) -> Result<(), OutboxError>;

    /// Insert an entry as-is (DLQ re-enqueue path); returns the new id.
    async fn insert_entry(&self, entry: &OutboxEntry) -> Result<i64, OutboxError>;

    async fn mark_published_batch(&self, ids: &[i64]) -> Result<(), OutboxError> {
        for id in ids {
            self.mark_published(*id).await?;
        }
        Ok(())
    }

    async fn mark_failed_batch(&self, marks: &[FailedMark]) -> Result<(), OutboxError> {
        for mark in marks {
            self.mark_failed(mark.id, &mark.error, mark.next_retry_at)
                .await?;
        }
        Ok(())
    }

    async fn delete_published_batch(&self, ids: &[i64]) -> Result<u64, OutboxError> {
        let mut deleted = 0;
        for id in ids {
            self.delete_entry(*id).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}
