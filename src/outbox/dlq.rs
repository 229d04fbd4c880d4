//! Dead-letter queue
//!
//! Outbox entries that exhaust their retries move to a parallel table
//! where operators can inspect, re-enqueue, or discard them.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{InMemoryOutboxRepository, OutboxEntry, OutboxError, OutboxRepository, OutboxStatus};

/// Archived row of the `event_outbox_dlq` table.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub id: i64,
    pub original_entry_id: i64,
    pub aggregate_id: i64,
    pub aggregate_type: String,
    pub event_id: String,
    pub event_type: String,
    pub event_data: String,
    pub failure_reason: String,
    pub retry_count: i32,
    pub moved_at: DateTime<Utc>,
}

impl DlqEntry {
    fn from_outbox(entry: &OutboxEntry) -> Self {
        Self {
            id: 0,
            original_entry_id: entry.id,
            aggregate_id: entry.aggregate_id,
            aggregate_type: entry.aggregate_type.clone(),
            event_id: entry.event_id.clone(),
            event_type: entry.event_type.clone(),
            event_data: entry.event_data.clone(),
            failure_reason: entry
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            retry_count: entry.retry_count,
            moved_at: Utc::now(),
        }
    }
}

/// When an entry is beyond saving.
#[derive(Debug, Clone)]
pub struct DlqPolicy {
    pub max_retries: i32,
}

impl Default for DlqPolicy {
    fn default() -> Self {
        Self { max_retries: 5 }
    }
}

impl DlqPolicy {
    pub fn new(max_retries: i32) -> Self {
        Self { max_retries }
    }

    pub fn should_move(&self, entry: &OutboxEntry) -> bool {
        entry.retry_count >= self.max_retries
    }
}

/// Storage port for the dead-letter queue.
#[async_trait]
pub trait DlqRepository: Send + Sync {
    /// Archive an exhausted entry, capturing its last error as the
    /// failure reason. With auto-cleanup the outbox row is deleted too.
    async fn move_to_dlq(&self, entry: &OutboxEntry) -> Result<(), OutboxError>;

    /// Archived entries, newest first.
    async fn entries(&self, limit: i64) -> Result<Vec<DlqEntry>, OutboxError>;

    /// Re-enqueue: insert a fresh pending outbox row, then delete the
    /// DLQ row. The DLQ row stays put when the insertion fails.
    async fn retry_from_dlq(&self, id: i64) -> Result<(), OutboxError>;

    async fn delete_entry(&self, id: i64) -> Result<(), OutboxError>;

    async fn count(&self) -> Result<i64, OutboxError>;
}

fn reenqueued_entry(dlq: &DlqEntry) -> OutboxEntry {
    OutboxEntry {
        id: 0,
        aggregate_id: dlq.aggregate_id,
        aggregate_type: dlq.aggregate_type.clone(),
        event_id: dlq.event_id.clone(),
        event_type: dlq.event_type.clone(),
        event_data: dlq.event_data.clone(),
        status: OutboxStatus::Pending,
        created_at: Utc::now(),
        published_at: None,
        retry_count: 0,
        last_error: None,
        next_retry_at: None,
    }
}

/// DLQ repository over the `event_outbox_dlq` table.
#[derive(Debug, Clone)]
pub struct PostgresDlqRepository {
    pool: PgPool,
    auto_cleanup: bool,
}

type DlqRow = (
    i64,
    i64,
    i64,
    String,
    String,
    String,
    String,
    String,
    i32,
    DateTime<Utc>,
);

const SELECT_COLUMNS: &str = "id, original_entry_id, aggregate_id, aggregate_type, event_id, \
     event_type, event_data, failure_reason, retry_count, moved_at";

impl PostgresDlqRepository {
    pub fn new(pool: PgPool, auto_cleanup: bool) -> Self {
        Self { pool, auto_cleanup }
    }
}

fn row_to_dlq(row: DlqRow) -> DlqEntry {
    let (
        id,
        original_entry_id,
        aggregate_id,
        aggregate_type,
        event_id,
        event_type,
        event_data,
        failure_reason,
        retry_count,
        moved_at,
    ) = row;

    DlqEntry {
        id,
        original_entry_id,
        aggregate_id,
        aggregate_type,
        event_id,
        event_type,
        event_data,
        failure_reason,
        retry_count,
        moved_at,
    }
}

#[async_trait]
impl DlqRepository for PostgresDlqRepository {
    async fn move_to_dlq(&self, entry: &OutboxEntry) -> Result<(), OutboxError> {
        let dlq = DlqEntry::from_outbox(entry);
        let mut tx = self.pool.begin().await.map_err(OutboxError::TxBegin)?;

        sqlx::query(
            r#"
            INSERT INTO event_outbox_dlq (
                original_entry_id, aggregate_id, aggregate_type, event_id,
                event_type, event_data, failure_reason, retry_count, moved_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(dlq.original_entry_id)
        .bind(dlq.aggregate_id)
        .bind(&dlq.aggregate_type)
        .bind(&dlq.event_id)
        .bind(&dlq.event_type)
        .bind(&dlq.event_data)
        .bind(&dlq.failure_reason)
        .bind(dlq.retry_count)
        .bind(dlq.moved_at)
        .execute(&mut *tx)
        .await
        .map_err(OutboxError::Save)?;

        if self.auto_cleanup {
            sqlx::query(
                r#"
                DELETE FROM event_outbox WHERE id = $1
                "#,
            )
            .bind(entry.id)
            .execute(&mut *tx)
            .await
            .map_err(OutboxError::Delete)?;
        }

        tx.commit().await.map_err(OutboxError::TxCommit)?;

        tracing::warn!(
            entry_id = entry.id,
            event_id = %entry.event_id,
            retry_count = entry.retry_count,
            "outbox entry moved to dead-letter queue"
        );

        Ok(())
    }

    async fn entries(&self, limit: i64) -> Result<Vec<DlqEntry>, OutboxError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM event_outbox_dlq ORDER BY moved_at DESC LIMIT $1"
        );
        let rows: Vec<DlqRow> = sqlx::query_as(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(row_to_dlq).collect())
    }

    async fn retry_from_dlq(&self, id: i64) -> Result<(), OutboxError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM event_outbox_dlq WHERE id = $1");
        let row: Option<DlqRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let dlq = row.map(row_to_dlq).ok_or(OutboxError::EntryNotFound(id))?;

        let entry = reenqueued_entry(&dlq);
        let mut tx = self.pool.begin().await.map_err(OutboxError::TxBegin)?;

        sqlx::query(
            r#"
            INSERT INTO event_outbox (
                aggregate_id, aggregate_type, event_id, event_type,
                event_data, status, created_at, retry_count
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, 0)
            "#,
        )
        .bind(entry.aggregate_id)
        .bind(&entry.aggregate_type)
        .bind(&entry.event_id)
        .bind(&entry.event_type)
        .bind(&entry.event_data)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await
        .map_err(OutboxError::Save)?;

        sqlx::query(
            r#"
            DELETE FROM event_outbox_dlq WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(OutboxError::Delete)?;

        tx.commit().await.map_err(OutboxError::TxCommit)?;

        Ok(())
    }

    async fn delete_entry(&self, id: i64) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            DELETE FROM event_outbox_dlq WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::Delete)?;

        Ok(())
    }

    async fn count(&self) -> Result<i64, OutboxError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM event_outbox_dlq
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

#[derive(Debug, Default)]
struct DlqInner {
    entries: Vec<DlqEntry>,
    next_id: i64,
}

/// In-memory DLQ over an [`InMemoryOutboxRepository`].
#[derive(Debug)]
pub struct InMemoryDlqRepository {
    outbox: Arc<InMemoryOutboxRepository>,
    auto_cleanup: bool,
    inner: Mutex<DlqInner>,
}

impl InMemoryDlqRepository {
    pub fn new(outbox: Arc<InMemoryOutboxRepository>, auto_cleanup: bool) -> Self {
        Self {
            outbox,
            auto_cleanup,
            inner: Mutex::new(DlqInner::default()),
        }
    }
}

#[async_trait]
impl DlqRepository for InMemoryDlqRepository {
    async fn move_to_dlq(&self, entry: &OutboxEntry) -> Result<(), OutboxError> {
        {
            let mut inner = self.inner.lock().expect("dlq lock poisoned");
            let mut dlq = DlqEntry::from_outbox(entry);
            inner.next_id += 1;
            dlq.id = inner.next_id;
            inner.entries.push(dlq);
        }

        if self.auto_cleanup {
            self.outbox.delete_entry(entry.id).await?;
        }
        Ok(())
    }

    async fn entries(&self, limit: i64) -> Result<Vec<DlqEntry>, OutboxError> {
        let inner = self.inner.lock().expect("dlq lock poisoned");
        let mut entries = inner.entries.clone();
        entries.sort_by(|a, b| b.moved_at.cmp(&a.moved_at));
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn retry_from_dlq(&self, id: i64) -> Result<(), OutboxError> {
        let dlq = {
            let inner = self.inner.lock().expect("dlq lock poisoned");
            inner
                .entries
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .ok_or(OutboxError::EntryNotFound(id))?
        };

        self.outbox.insert_entry(&reenqueued_entry(&dlq)).await?;

        let mut inner = self.inner.lock().expect("dlq lock poisoned");
        inner.entries.retain(|e| e.id != id);
        Ok(())
    }

    async fn delete_entry(&self, id: i64) -> Result<(), OutboxError> {
        let mut inner = self.inner.lock().expect("dlq lock poisoned");
        inner.entries.retain(|e| e.id != id);
        Ok(())
    }

    async fn count(&self) -> Result<i64, OutboxError> {
        let inner = self.inner.lock().expect("dlq lock poisoned");
        Ok(inner.entries.len() as i64)
    }
}
