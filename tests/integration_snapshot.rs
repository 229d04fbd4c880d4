//! Integration tests for snapshot-accelerated rebuilds.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{BankAccount, BankAccountEvent};
use eventfold::snapshot::EventCountStrategy;
use eventfold::{
    AggregateRoot, EventStore, InMemoryEventStore, InMemorySnapshotStore, RepositoryBuilder,
    SnapshotConfig, SnapshotManager,
};
use rust_decimal_macros::dec;

fn snapshot_rig(
    frequency: i64,
) -> (
    Arc<InMemoryEventStore>,
    Arc<SnapshotManager>,
    eventfold::AggregateRepository<BankAccount>,
) {
    let store = Arc::new(InMemoryEventStore::new());
    let manager = Arc::new(SnapshotManager::new(
        Arc::new(InMemorySnapshotStore::new()),
        Arc::new(EventCountStrategy::new(1)),
        SnapshotConfig {
            enabled: true,
            frequency,
            retention: Duration::from_secs(3600),
        },
    ));
    let repository = RepositoryBuilder::<BankAccount>::new()
        .event_store(store.clone())
        .snapshot_manager(manager.clone())
        .build()
        .unwrap();
    (store, manager, repository)
}

async fn seed_account(
    repository: &eventfold::AggregateRepository<BankAccount>,
    id: i64,
    deposits: usize,
) {
    let mut account = AggregateRoot::<BankAccount>::new(id);
    account
        .apply_and_record(BankAccountEvent::AccountOpened { initial: dec!(100) })
        .unwrap();
    for _ in 0..deposits {
        account
            .apply_and_record(BankAccountEvent::Deposited { amount: dec!(5) })
            .unwrap();
    }
    repository.save(&mut account).await.unwrap();
}

#[tokio::test]
async fn test_snapshot_then_tail_replay_matches_full_replay() {
    common::init_tracing();
    let (store, manager, repository) = snapshot_rig(3);

    // Five events, then an explicit checkpoint.
    seed_account(&repository, 2001, 4).await;
    let account = repository.get_by_id(2001).await.unwrap();
    assert_eq!(account.version(), 5);
    manager.create_snapshot(&account).await.unwrap();

    // The snapshot covers the whole stream, so the tail is empty.
    assert!(store.load_events(2001, 5).await.unwrap().is_empty());

    // Rebuild through the snapshot path...
    let via_snapshot = repository.get_by_id(2001).await.unwrap();

    // ...and compare against a repository with no snapshot manager.
    let plain = RepositoryBuilder::<BankAccount>::new()
        .event_store(store.clone())
        .build()
        .unwrap();
    let via_replay = plain.get_by_id(2001).await.unwrap();

    assert_eq!(via_snapshot.version(), via_replay.version());
    assert_eq!(via_snapshot.state().balance, via_replay.state().balance);
    assert_eq!(via_snapshot.state().balance, dec!(120));
}

#[tokio::test]
async fn test_snapshot_plus_newer_events() {
    common::init_tracing();
    let (_, manager, repository) = snapshot_rig(3);

    seed_account(&repository, 9, 2).await;
    let account = repository.get_by_id(9).await.unwrap();
    manager.create_snapshot(&account).await.unwrap();

    // Three more events on top of the checkpoint.
    let mut account = repository.get_by_id(9).await.unwrap();
    for _ in 0..3 {
        account
            .apply_and_record(BankAccountEvent::Deposited { amount: dec!(1) })
            .unwrap();
    }
    repository.save(&mut account).await.unwrap();

    let rebuilt = repository.get_by_id(9).await.unwrap();
    assert_eq!(rebuilt.version(), 6);
    assert_eq!(rebuilt.state().balance, dec!(113));
}

#[tokio::test]
async fn test_should_create_snapshot_respects_delta_guard() {
    common::init_tracing();
    let (_, manager, repository) = snapshot_rig(3);

    seed_account(&repository, 11, 4).await;
    let account = repository.get_by_id(11).await.unwrap();
    assert!(manager.should_create_snapshot(&account).await);
    manager.create_snapshot(&account).await.unwrap();

    // Fewer than `frequency` new events: no new snapshot yet.
    let mut account = repository.get_by_id(11).await.unwrap();
    account
        .apply_and_record(BankAccountEvent::Deposited { amount: dec!(1) })
        .unwrap();
    repository.save(&mut account).await.unwrap();
    assert!(!manager.should_create_snapshot(&account).await);

    // Three more events since the checkpoint: due again.
    let mut account = repository.get_by_id(11).await.unwrap();
    account
        .apply_and_record(BankAccountEvent::Deposited { amount: dec!(1) })
        .unwrap();
    account
        .apply_and_record(BankAccountEvent::Deposited { amount: dec!(1) })
        .unwrap();
    repository.save(&mut account).await.unwrap();
    assert!(manager.should_create_snapshot(&account).await);
}

#[tokio::test]
async fn test_losing_snapshots_does_not_affect_state() {
    common::init_tracing();
    let (_, manager, repository) = snapshot_rig(1);

    seed_account(&repository, 21, 3).await;
    let account = repository.get_by_id(21).await.unwrap();
    manager.create_snapshot(&account).await.unwrap();

    // Drop every snapshot; the rebuild falls back to full replay.
    manager
        .store()
        .delete("BankAccount", 21)
        .await
        .unwrap();

    let rebuilt = repository.get_by_id(21).await.unwrap();
    assert_eq!(rebuilt.version(), 4);
    assert_eq!(rebuilt.state().balance, dec!(115));
}

#[tokio::test]
async fn test_save_creates_snapshot_automatically() {
    common::init_tracing();
    let (_, manager, repository) = snapshot_rig(2);

    seed_account(&repository, 31, 3).await;

    // Four events with frequency 2: the save-path snapshot hook fired.
    let stored = manager.store().get("BankAccount", 31).await.unwrap();
    let snapshot = stored.expect("snapshot created on save");
    assert_eq!(snapshot.version, 4);
    assert_eq!(
        snapshot.metadata.get("created_by").and_then(|v| v.as_str()),
        Some("snapshot_manager")
    );
}
