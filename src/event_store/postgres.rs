//! PostgreSQL event store
//!
//! Core implementation of the Event Store pattern over sqlx.
//! Provides atomic event persistence with optimistic concurrency control.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use async_trait::async_trait;

use crate::event::Event;

use super::{
    validate_batch, AggregateInspector, EventStore, EventStoreError, StreamOptions,
    StreamingEventStore, TypedEventStore,
};

type EventRow = (
    String,                // id
    String,                // aggregate_type
    i64,                   // aggregate_id
    i64,                   // version
    String,                // event_type
    serde_json::Value,     // event_data
    serde_json::Value,     // metadata
    i32,                   // schema_version
    DateTime<Utc>,         // created_at
);

const SELECT_COLUMNS: &str =
    "id, aggregate_type, aggregate_id, version, event_type, event_data, metadata, schema_version, created_at";

/// Event store persisting streams in the `events` table.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Create a new store with a database pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a batch on an existing transaction.
    ///
    /// The outbox repository uses this variant so event rows and outbox
    /// rows commit together.
    pub async fn append_events_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        aggregate_id: i64,
        events: &[Event],
        expected_version: i64,
    ) -> Result<(), EventStoreError> {
        if events.is_empty() {
            return Ok(());
        }
        validate_batch(aggregate_id, events, expected_version)?;

        let current = current_version(tx, aggregate_id).await?;
        if current != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual: current,
            });
        }

        for event in events {
            let metadata = serde_json::to_value(&event.metadata)?;
            sqlx::query(
                r#"
                INSERT INTO events (
                    id, aggregate_type, aggregate_id, version,
                    event_type, event_data, metadata, schema_version, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(&event.id)
            .bind(&event.aggregate_type)
            .bind(event.aggregate_id)
            .bind(event.version)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(&metadata)
            .bind(event.schema_version)
            .bind(event.timestamp)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    async fn fetch_events(
        &self,
        aggregate_type: Option<&str>,
        aggregate_id: i64,
        after_version: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Event>, EventStoreError> {
        let sql = match (aggregate_type.is_some(), limit.is_some()) {
            (false, false) => format!(
                "SELECT {SELECT_COLUMNS} FROM events \
                 WHERE aggregate_id = $1 AND version > $2 ORDER BY version ASC"
            ),
            (false, true) => format!(
                "SELECT {SELECT_COLUMNS} FROM events \
                 WHERE aggregate_id = $1 AND version > $2 ORDER BY version ASC LIMIT $3"
            ),
            (true, false) => format!(
                "SELECT {SELECT_COLUMNS} FROM events \
                 WHERE aggregate_id = $1 AND version > $2 AND aggregate_type = $3 \
                 ORDER BY version ASC"
            ),
            (true, true) => format!(
                "SELECT {SELECT_COLUMNS} FROM events \
                 WHERE aggregate_id = $1 AND version > $2 AND aggregate_type = $3 \
                 ORDER BY version ASC LIMIT $4"
            ),
        };

        let mut query = sqlx::query_as::<_, EventRow>(&sql)
            .bind(aggregate_id)
            .bind(after_version);
        if let Some(aggregate_type) = aggregate_type {
            query = query.bind(aggregate_type);
        }
        if let Some(limit) = limit {
            query = query.bind(limit);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_event).collect()
    }
}

/// Current tail version of an aggregate, read inside the transaction
/// so the optimistic check and the inserts see one consistent state.
async fn current_version(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: i64,
) -> Result<i64, EventStoreError> {
    let result: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT MAX(version) FROM events WHERE aggregate_id = $1
        "#,
    )
    .bind(aggregate_id)
    .fetch_optional(&mut **tx)
    .await?
    .flatten();

    Ok(result.unwrap_or(0))
}

fn row_to_event(row: EventRow) -> Result<Event, EventStoreError> {
    let (id, aggregate_type, aggregate_id, version, event_type, event_data, metadata, schema_version, created_at) =
        row;
    let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata)?;

    Ok(Event {
        id,
        event_type,
        timestamp: created_at,
        payload: event_data,
        metadata,
        aggregate_id,
        aggregate_type,
        version,
        schema_version,
    })
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append_events(
        &self,
        aggregate_id: i64,
        events: &[Event],
        expected_version: i64,
    ) -> Result<(), EventStoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        self.append_events_in_tx(&mut tx, aggregate_id, events, expected_version)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    async fn load_events(
        &self,
        aggregate_id: i64,
        after_version: i64,
    ) -> Result<Vec<Event>, EventStoreError> {
        self.fetch_events(None, aggregate_id, after_version, None).await
    }

    fn as_inspector(&self) -> Option<&dyn AggregateInspector> {
        Some(self)
    }

    fn as_typed(&self) -> Option<&dyn TypedEventStore> {
        Some(self)
    }

    fn as_streaming(&self) -> Option<&dyn StreamingEventStore> {
        Some(self)
    }
}

#[async_trait]
impl AggregateInspector for PostgresEventStore {
    async fn has_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: i64,
    ) -> Result<bool, EventStoreError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM events WHERE aggregate_type = $1 AND aggregate_id = $2
            )
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn aggregate_version(
        &self,
        aggregate_type: &str,
        aggregate_id: i64,
    ) -> Result<i64, EventStoreError> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(version) FROM events WHERE aggregate_type = $1 AND aggregate_id = $2
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        Ok(version.unwrap_or(0))
    }
}

#[async_trait]
impl TypedEventStore for PostgresEventStore {
    async fn load_events_by_type(
        &self,
        aggregate_type: &str,
        aggregate_id: i64,
        after_version: i64,
    ) -> Result<Vec<Event>, EventStoreError> {
        self.fetch_events(Some(aggregate_type), aggregate_id, after_version, None)
            .await
    }
}

#[async_trait]
impl StreamingEventStore for PostgresEventStore {
    async fn stream_aggregate(
        &self,
        options: &StreamOptions,
    ) -> Result<Vec<Event>, EventStoreError> {
        let aggregate_type = if options.aggregate_type.is_empty() {
            None
        } else {
            Some(options.aggregate_type.as_str())
        };
        self.fetch_events(
            aggregate_type,
            options.aggregate_id,
            options.after_version,
            options.limit,
        )
        .await
    }
}
