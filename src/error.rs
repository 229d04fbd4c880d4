//! Error handling module
//!
//! Centralized error type surfaced at the runtime boundary. Subsystem
//! errors are normalized here and exposed with a stable string code so
//! embedding applications can branch without matching enum variants.

use crate::event_store::EventStoreError;
use crate::outbox::OutboxError;

/// Runtime-wide Result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced at the runtime boundary
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Entity already exists: {0}")]
    EntityAlreadyExists(String),

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Version conflict for aggregate {aggregate_id}: expected {expected}, found {actual}")]
    VersionConflict {
        aggregate_id: i64,
        expected: i64,
        actual: i64,
    },

    #[error("Invalid version for aggregate {aggregate_id}: expected {expected}, got {actual}")]
    InvalidVersion {
        aggregate_id: i64,
        expected: i64,
        actual: i64,
    },

    #[error("Entity already deleted: {0}")]
    AlreadyDeleted(String),

    #[error("Entity not deleted: {0}")]
    NotDeleted(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Repository operation failed: {0}")]
    RepositoryFailed(String),

    #[error("Storage error: {0}")]
    Storage(#[source] EventStoreError),

    #[error("Outbox error: {0}")]
    Outbox(#[source] OutboxError),

    #[error("Dependency failure: {0}")]
    Dependency(String),

    #[error("No handler registered for command: {0}")]
    HandlerNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl CoreError {
    /// Stable string code for the error, usable in logs and API
    /// responses without matching on variants.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::EntityNotFound(_) => "ENTITY_NOT_FOUND",
            CoreError::EntityAlreadyExists(_) => "ENTITY_ALREADY_EXISTS",
            CoreError::InvalidId(_) => "INVALID_ID",
            CoreError::VersionConflict { .. } => "VERSION_CONFLICT",
            CoreError::InvalidVersion { .. } => "INVALID_VERSION",
            CoreError::AlreadyDeleted(_) => "ALREADY_DELETED",
            CoreError::NotDeleted(_) => "NOT_DELETED",
            CoreError::Validation(_) => "VALIDATION_FAILED",
            CoreError::RepositoryFailed(_) => "REPOSITORY_FAILED",
            CoreError::Storage(_) => "REPOSITORY_FAILED",
            CoreError::Outbox(e) => e.code(),
            CoreError::Dependency(_) => "DEPENDENCY",
            CoreError::HandlerNotFound(_) => "HANDLER_NOT_FOUND",
            CoreError::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
        }
    }

    /// Check if this error is an optimistic concurrency conflict, the
    /// one kind callers are expected to retry by reloading.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, CoreError::VersionConflict { .. })
    }
}

impl From<EventStoreError> for CoreError {
    fn from(e: EventStoreError) -> Self {
        match e {
            EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual,
            } => CoreError::VersionConflict {
                aggregate_id,
                expected,
                actual,
            },
            EventStoreError::InvalidVersion {
                aggregate_id,
                expected,
                actual,
            } => CoreError::InvalidVersion {
                aggregate_id,
                expected,
                actual,
            },
            EventStoreError::AggregateNotFound(id) => CoreError::EntityNotFound(id.to_string()),
            EventStoreError::InvalidEventData(msg) => CoreError::Validation(msg),
            other => CoreError::Storage(other),
        }
    }
}

impl From<OutboxError> for CoreError {
    fn from(e: OutboxError) -> Self {
        match e {
            // A conflict inside the outbox transaction is still a
            // conflict to the caller.
            OutboxError::AppendEvents(inner) => inner.into(),
            other => CoreError::Outbox(other),
        }
    }
}
