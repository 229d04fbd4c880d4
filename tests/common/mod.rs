//! Common test utilities
//!
//! A bank-account aggregate and an in-memory infrastructure rig shared
//! by the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use eventfold::{
    Aggregate, AggregateRepository, BusError, Event, EventHandler, InMemoryEventStore,
    RepositoryBuilder, SnapshotData,
};

static INIT: Once = Once::new();

/// Initialize tracing once for the whole test binary.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "eventfold=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Bank account events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BankAccountEvent {
    AccountOpened { initial: Decimal },
    Deposited { amount: Decimal },
    Withdrawn { amount: Decimal },
}

/// Bank account errors
#[derive(Debug, thiserror::Error)]
pub enum BankAccountError {
    #[error("account is already open")]
    AlreadyOpen,

    #[error("account is not open")]
    NotOpen,

    #[error("insufficient balance")]
    InsufficientBalance,
}

/// Bank account aggregate state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BankAccount {
    pub open: bool,
    pub balance: Decimal,
}

impl Aggregate for BankAccount {
    type Event = BankAccountEvent;
    type Error = BankAccountError;

    fn aggregate_type() -> &'static str {
        "BankAccount"
    }

    fn event_type(event: &Self::Event) -> &'static str {
        match event {
            BankAccountEvent::AccountOpened { .. } => "AccountOpened",
            BankAccountEvent::Deposited { .. } => "Deposited",
            BankAccountEvent::Withdrawn { .. } => "Withdrawn",
        }
    }

    fn apply(&mut self, event: &Self::Event) -> Result<(), Self::Error> {
        match event {
            BankAccountEvent::AccountOpened { initial } => {
                if self.open {
                    return Err(BankAccountError::AlreadyOpen);
                }
                self.open = true;
                self.balance = *initial;
            }
            BankAccountEvent::Deposited { amount } => {
                if !self.open {
                    return Err(BankAccountError::NotOpen);
                }
                self.balance += *amount;
            }
            BankAccountEvent::Withdrawn { amount } => {
                if !self.open {
                    return Err(BankAccountError::NotOpen);
                }
                if self.balance < *amount {
                    return Err(BankAccountError::InsufficientBalance);
                }
                self.balance -= *amount;
            }
        }
        Ok(())
    }
}

impl SnapshotData for BankAccount {}

/// Repository over a fresh in-memory event store.
pub fn account_repository() -> (Arc<InMemoryEventStore>, AggregateRepository<BankAccount>) {
    let store = Arc::new(InMemoryEventStore::new());
    let repository = RepositoryBuilder::<BankAccount>::new()
        .event_store(store.clone())
        .build()
        .expect("repository builds");
    (store, repository)
}

/// Bus handler that records every event id it sees.
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<Event> {
        self.seen.lock().unwrap().clone()
    }

    pub fn event_ids(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|e| e.id.clone()).collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) -> Result<(), BusError> {
        self.seen.lock().unwrap().push(event.clone());
        Ok(())
    }
}
