//! eventfold
//!
//! Embeddable event-sourcing runtime: aggregates whose state is the
//! fold of an append-only event stream, persisted with optimistic
//! concurrency, rebuilt on demand (optionally from snapshots), and
//! propagated to subscribers through a transactional outbox.

pub mod aggregate;
pub mod bus;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod event_store;
pub mod outbox;
pub mod repository;
pub mod snapshot;

pub use aggregate::{Aggregate, AggregateRoot, SnapshotData};
pub use bus::{BusError, EventBus, EventHandler, InMemoryEventBus, SubscriptionId};
pub use command::{Command, CommandHandler, CommandHook, CommandService};
pub use config::{ConfigError, OutboxConfig, SnapshotConfig};
pub use error::{CoreError, CoreResult};
pub use event::{Event, EventUpgrader, IdGenerator, UuidIdGenerator};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, PostgresEventStore};
pub use outbox::{
    DlqEntry, DlqPolicy, DlqRepository, InMemoryDlqRepository, InMemoryOutboxRepository,
    OutboxEntry, OutboxError, OutboxPublisher, OutboxRepository, OutboxStatus,
    ParallelOutboxPublisher, PostgresDlqRepository, PostgresOutboxRepository,
};
pub use repository::{AggregateRepository, RepositoryBuilder};
pub use snapshot::{
    InMemorySnapshotStore, PostgresSnapshotStore, Snapshot, SnapshotError, SnapshotManager,
    SnapshotStore, SnapshotStrategy,
};
