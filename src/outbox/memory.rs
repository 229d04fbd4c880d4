//! In-memory outbox repository
//!
//! Test double pairing an in-memory event store with a lock-guarded
//! entry table. Semantics mirror the SQL implementation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::event::Event;
use crate::event_store::InMemoryEventStore;

use super::{OutboxEntry, OutboxError, OutboxRepository, OutboxStatus};

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<OutboxEntry>,
    next_id: i64,
}

/// Outbox repository over an [`InMemoryEventStore`].
#[derive(Debug)]
pub struct InMemoryOutboxRepository {
    event_store: Arc<InMemoryEventStore>,
    inner: Mutex<Inner>,
}

impl InMemoryOutboxRepository {
    pub fn new(event_store: Arc<InMemoryEventStore>) -> Self {
        Self {
            event_store,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Snapshot of all entries, for assertions.
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.inner
            .lock()
            .expect("outbox lock poisoned")
            .entries
            .clone()
    }

    /// Look up one entry by id.
    pub fn entry(&self, id: i64) -> Option<OutboxEntry> {
        self.inner
            .lock()
            .expect("outbox lock poisoned")
            .entries
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn save_with_events(
        &self,
        aggregate_id: i64,
        events: &[Event],
    ) -> Result<(), OutboxError> {
        if events.is_empty() {
            return Ok(());
        }
        let expected_version = events[0].version - 1;

        // Serialize entries up front so a bad envelope fails the whole
        // batch before anything is written.
        let mut pending = Vec::with_capacity(events.len());
        for event in events {
            pending.push(OutboxEntry::from_event(event)?);
        }

        let mut inner = self.inner.lock().expect("outbox lock poisoned");
        self.event_store
            .append_sync(aggregate_id, events, expected_version)
            .map_err(OutboxError::AppendEvents)?;

        for mut entry in pending {
            inner.next_id += 1;
            entry.id = inner.next_id;
            inner.entries.push(entry);
        }

        Ok(())
    }

    async fn pending_entries(&self, limit: i64) -> Result<Vec<OutboxEntry>, OutboxError> {
        let now = Utc::now();
        let inner = self.inner.lock().expect("outbox lock poisoned");

        let mut due: Vec<OutboxEntry> = inner
            .entries
            .iter()
            .filter(|e| match e.status {
                OutboxStatus::Pending => true,
                OutboxStatus::Failed => e.next_retry_at.map(|t| t <= now).unwrap_or(true),
                OutboxStatus::Published => false,
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn mark_published(&self, id: i64) -> Result<(), OutboxError> {
        let mut inner = self.inner.lock().expect("outbox lock poisoned");
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(OutboxError::EntryNotFound(id))?;
        entry.status = OutboxStatus::Published;
        entry.published_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        let mut inner = self.inner.lock().expect("outbox lock poisoned");
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(OutboxError::EntryNotFound(id))?;
        entry.status = OutboxStatus::Failed;
        entry.last_error = Some(error.to_string());
        entry.next_retry_at = Some(next_retry_at);
        entry.retry_count += 1;
        Ok(())
    }

    async fn delete_published(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxError> {
        let mut inner = self.inner.lock().expect("outbox lock poisoned");
        let before = inner.entries.len();
        inner.entries.retain(|e| {
            !(e.status == OutboxStatus::Published
                && e.published_at.map(|t| t < older_than).unwrap_or(false))
        });
        Ok((before - inner.entries.len()) as u64)
    }

    async fn delete_entry(&self, id: i64) -> Result<(), OutboxError> {
        let mut inner = self.inner.lock().expect("outbox lock poisoned");
        inner.entries.retain(|e| e.id != id);
        Ok(())
    }

    async fn insert_entry(&self, entry: &OutboxEntry) -> Result<i64, OutboxError> {
        let mut inner = self.inner.lock().expect("outbox lock poisoned");
        inner.next_id += 1;
        let id = inner.next_id;
        let mut entry = entry.clone();
        entry.id = id;
        inner.entries.push(entry);
        Ok(id)
    }
}
