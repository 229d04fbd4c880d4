//! PostgreSQL snapshot store
//!
//! One row per aggregate in `event_snapshots`, written with an UPSERT
//! keyed by `(aggregate_type, aggregate_id)`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{Snapshot, SnapshotError, SnapshotStore};

type SnapshotRow = (
    String,            // aggregate_type
    i64,               // aggregate_id
    i64,               // version
    serde_json::Value, // data
    DateTime<Utc>,     // created_at
    serde_json::Value, // metadata
);

const SELECT_COLUMNS: &str = "aggregate_type, aggregate_id, version, data, created_at, metadata";

#[derive(Debug, Clone)]
pub struct PostgresSnapshotStore {
    pool: PgPool,
}

impl PostgresSnapshotStore {
    /// Create a new store with a database pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_snapshot(row: SnapshotRow) -> Result<Snapshot, SnapshotError> {
    let (aggregate_type, aggregate_id, version, data, created_at, metadata) = row;
    let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata)?;

    Ok(Snapshot {
        aggregate_type,
        aggregate_id,
        version,
        data,
        timestamp: created_at,
        metadata,
    })
}

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let metadata = serde_json::to_value(&snapshot.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO event_snapshots (aggregate_type, aggregate_id, version, data, created_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (aggregate_type, aggregate_id)
            DO UPDATE SET version = $3, data = $4, created_at = $5, metadata = $6
            "#,
        )
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.aggregate_id)
        .bind(snapshot.version)
        .bind(&snapshot.data)
        .bind(snapshot.timestamp)
        .bind(&metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(
        &self,
        aggregate_type: &str,
        aggregate_id: i64,
    ) -> Result<Option<Snapshot>, SnapshotError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM event_snapshots \
             WHERE aggregate_type = $1 AND aggregate_id = $2"
        );
        let row: Option<SnapshotRow> = sqlx::query_as(&sql)
            .bind(aggregate_type)
            .bind(aggregate_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_snapshot).transpose()
    }

    async fn delete(&self, aggregate_type: &str, aggregate_id: i64) -> Result<(), SnapshotError> {
        sqlx::query(
            r#"
            DELETE FROM event_snapshots WHERE aggregate_type = $1 AND aggregate_id = $2
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self, aggregate_type: &str, limit: i64) -> Result<Vec<Snapshot>, SnapshotError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM event_snapshots \
             WHERE aggregate_type = $1 ORDER BY created_at DESC LIMIT $2"
        );
        let rows: Vec<SnapshotRow> = sqlx::query_as(&sql)
            .bind(aggregate_type)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_snapshot).collect()
    }

    async fn cleanup(&self, retention: Duration) -> Result<u64, SnapshotError> {
        let cutoff = Utc::now() - retention;
        let result = sqlx::query(
            r#"
            DELETE FROM event_snapshots WHERE created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
