//! Event store error type
//!
//! Failures raised by the append/load port. A version conflict is
//! ordinary control flow for optimistic writers; everything else points
//! at broken input or broken infrastructure.

/// Failure modes of an event store operation.
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// Another writer advanced the stream first. Reloading the
    /// aggregate and re-running the command resolves it.
    #[error("stream {aggregate_id} is at version {actual}, writer expected {expected}")]
    ConcurrencyConflict {
        aggregate_id: i64,
        expected: i64,
        actual: i64,
    },

    /// The batch itself is malformed: its versions do not continue the
    /// stream directly after the expected tail. Unlike a conflict this
    /// is a caller bug, not a race.
    #[error("event batch for aggregate {aggregate_id} carries version {actual} where {expected} was required")]
    InvalidVersion {
        aggregate_id: i64,
        expected: i64,
        actual: i64,
    },

    /// Raised by stores that signal unknown streams instead of handing
    /// back an empty list; the repository adapter flattens it to empty.
    #[error("no event stream for aggregate {0}")]
    AggregateNotFound(i64),

    /// An envelope failed validation before touching storage.
    #[error("rejected event batch: {0}")]
    InvalidEventData(String),

    #[error("database failure: {0}")]
    Database(#[from] sqlx::Error),

    #[error("event payload could not be encoded or decoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// True when this is the losing side of an optimistic write race.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Whether retrying the operation can possibly succeed: conflicts
    /// clear once the writer reloads, and database hiccups may pass.
    /// Malformed batches and unknown streams never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConcurrencyConflict { .. } | Self::Database(_) => true,
            Self::InvalidVersion { .. }
            | Self::AggregateNotFound(_)
            | Self::InvalidEventData(_)
            | Self::Serialization(_) => false,
        }
    }
}
