//! PostgreSQL outbox repository
//!
//! Events and their outbox rows commit on one transaction, so a saved
//! aggregate change can never lose its publication record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::event::Event;
use crate::event_store::PostgresEventStore;

use super::{FailedMark, OutboxEntry, OutboxError, OutboxRepository, OutboxStatus};

type OutboxRow = (
    i64,                   // id
    i64,                   // aggregate_id
    String,                // aggregate_type
    String,                // event_id
    String,                // event_type
    String,                // event_data
    String,                // status
    DateTime<Utc>,         // created_at
    Option<DateTime<Utc>>, // published_at
    i32,                   // retry_count
    Option<String>,        // last_error
    Option<DateTime<Utc>>, // next_retry_at
);

const SELECT_COLUMNS: &str = "id, aggregate_id, aggregate_type, event_id, event_type, event_data, \
     status, created_at, published_at, retry_count, last_error, next_retry_at";

/// Outbox repository over the `event_outbox` table.
#[derive(Debug, Clone)]
pub struct PostgresOutboxRepository {
    pool: PgPool,
    event_store: PostgresEventStore,
}

impl PostgresOutboxRepository {
    /// Create a new repository with a database pool
    pub fn new(pool: PgPool) -> Self {
        let event_store = PostgresEventStore::new(pool.clone());
        Self { pool, event_store }
    }
}

fn row_to_entry(row: OutboxRow) -> OutboxEntry {
    let (
        id,
        aggregate_id,
        aggregate_type,
        event_id,
        event_type,
        event_data,
        status,
        created_at,
        published_at,
        retry_count,
        last_error,
        next_retry_at,
    ) = row;

    OutboxEntry {
        id,
        aggregate_id,
        aggregate_type,
        event_id,
        event_type,
        event_data,
        status: OutboxStatus::from(status),
        created_at,
        published_at,
        retry_count,
        last_error,
        next_retry_at,
    }
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    async fn save_with_events(
        &self,
        aggregate_id: i64,
        events: &[Event],
    ) -> Result<(), OutboxError> {
        if events.is_empty() {
            return Ok(());
        }
        let expected_version = events[0].version - 1;

        let mut tx = self.pool.begin().await.map_err(OutboxError::TxBegin)?;

        self.event_store
            .append_events_in_tx(&mut tx, aggregate_id, events, expected_version)
            .await
            .map_err(OutboxError::AppendEvents)?;

        for event in events {
            let event_data = serde_json::to_string(event)?;
            sqlx::query(
                r#"
                INSERT INTO event_outbox (
                    aggregate_id, aggregate_type, event_id, event_type,
                    event_data, status, created_at, retry_count
                )
                VALUES ($1, $2, $3, $4, $5, 'pending', NOW(), 0)
                "#,
            )
            .bind(event.aggregate_id)
            .bind(&event.aggregate_type)
            .bind(&event.id)
            .bind(&event.event_type)
            .bind(&event_data)
            .execute(&mut *tx)
            .await
            .map_err(OutboxError::Save)?;
        }

        tx.commit().await.map_err(OutboxError::TxCommit)?;

        tracing::debug!(
            aggregate_id,
            count = events.len(),
            "events appended with outbox entries"
        );

        Ok(())
    }

    async fn pending_entries(&self, limit: i64) -> Result<Vec<OutboxEntry>, OutboxError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM event_outbox \
             WHERE status = 'pending' \
                OR (status = 'failed' AND (next_retry_at IS NULL OR next_retry_at <= NOW())) \
             ORDER BY created_at ASC \
             LIMIT $1"
        );
        let rows: Vec<OutboxRow> = sqlx::query_as(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(row_to_entry).collect())
    }

    async fn mark_published(&self, id: i64) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'published', published_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|source| OutboxError::PublishUpdate { id, source })?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EntryNotFound(id));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'failed',
                last_error = $2,
                next_retry_at = $3,
                retry_count = retry_count + 1
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await
        .map_err(|source| OutboxError::MarkFailed { id, source })?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EntryNotFound(id));
        }
        Ok(())
    }

    async fn delete_published(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            DELETE FROM event_outbox
            WHERE status = 'published' AND published_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::Delete)?;

        Ok(result.rows_affected())
    }

    async fn delete_entry(&self, id: i64) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            DELETE FROM event_outbox WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::Delete)?;

        Ok(())
    }

    async fn insert_entry(&self, entry: &OutboxEntry) -> Result<i64, OutboxError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO event_outbox (
                aggregate_id, aggregate_type, event_id, event_type, event_data,
                status, created_at, published_at, retry_count, last_error, next_retry_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(entry.aggregate_id)
        .bind(&entry.aggregate_type)
        .bind(&entry.event_id)
        .bind(&entry.event_type)
        .bind(&entry.event_data)
        .bind(entry.status.as_str())
        .bind(entry.created_at)
        .bind(entry.published_at)
        .bind(entry.retry_count)
        .bind(&entry.last_error)
        .bind(entry.next_retry_at)
        .fetch_one(&self.pool)
        .await
        .map_err(OutboxError::Save)?;

        Ok(id)
    }

    async fn mark_published_batch(&self, ids: &[i64]) -> Result<(), OutboxError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'published', published_at = NOW()
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(|source| OutboxError::PublishUpdate { id: ids[0], source })?;

        Ok(())
    }

    async fn mark_failed_batch(&self, marks: &[FailedMark]) -> Result<(), OutboxError> {
        if marks.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "UPDATE event_outbox SET status = 'failed', retry_count = retry_count + 1, \
             last_error = CASE id ",
        );
        for mark in marks {
            builder.push("WHEN ");
            builder.push_bind(mark.id);
            builder.push(" THEN ");
            builder.push_bind(&mark.error);
            builder.push(" ");
        }
        builder.push("END, next_retry_at = CASE id ");
        for mark in marks {
            builder.push("WHEN ");
            builder.push_bind(mark.id);
            builder.push(" THEN ");
            builder.push_bind(mark.next_retry_at);
            builder.push(" ");
        }
        builder.push("END WHERE id IN (");
        let mut separated = builder.separated(", ");
        for mark in marks {
            separated.push_bind(mark.id);
        }
        builder.push(")");

        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|source| OutboxError::MarkFailed {
                id: marks[0].id,
                source,
            })?;

        Ok(())
    }

    async fn delete_published_batch(&self, ids: &[i64]) -> Result<u64, OutboxError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM event_outbox
            WHERE status = 'published' AND id = ANY($1)
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::Delete)?;

        Ok(result.rows_affected())
    }
}
