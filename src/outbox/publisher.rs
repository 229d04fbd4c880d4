//! Outbox publisher
//!
//! Background pumps that deliver pending outbox entries to the event
//! bus: a serial single-loop flavor and a parallel worker-pool flavor,
//! sharing the retry and dead-letter logic.
//!
//! Delivery is at-least-once: publish and status update are separate
//! writes, so a crash between them re-delivers on the next tick.
//! Subscribers deduplicate by event id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::bus::EventBus;
use crate::config::OutboxConfig;

use super::{DlqPolicy, DlqRepository, OutboxEntry, OutboxRepository};

/// Shared entry-processing logic of both publisher flavors.
#[derive(Clone)]
struct PublisherCore {
    repository: Arc<dyn OutboxRepository>,
    bus: Arc<dyn EventBus>,
    dlq: Option<Arc<dyn DlqRepository>>,
    policy: DlqPolicy,
    config: OutboxConfig,
}

impl PublisherCore {
    fn new(
        repository: Arc<dyn OutboxRepository>,
        bus: Arc<dyn EventBus>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            repository,
            bus,
            dlq: None,
            policy: DlqPolicy::new(config.max_retries),
            config,
        }
    }

    /// Fetch one batch and process every entry; returns how many were
    /// published.
    async fn process_once(&self) -> usize {
        let entries = match self.repository.pending_entries(self.config.batch_size).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(code = e.code(), error = %e, "failed to fetch pending outbox entries");
                return 0;
            }
        };

        let mut published = 0;
        for entry in &entries {
            if self.process_entry(entry).await {
                published += 1;
            }
        }
        if published > 0 {
            tracing::debug!(published, fetched = entries.len(), "outbox batch processed");
        }
        published
    }

    /// Deserialize, publish, and mark one entry.
    async fn process_entry(&self, entry: &OutboxEntry) -> bool {
        if self.policy.should_move(entry) {
            // Already archived (or waiting for an operator when no DLQ
            // is attached); never publish past the retry budget.
            tracing::warn!(
                entry_id = entry.id,
                event_id = %entry.event_id,
                retry_count = entry.retry_count,
                "entry exceeded max retries; skipping"
            );
            return false;
        }

        let event = match entry.to_event() {
            Ok(event) => event,
            Err(e) => {
                self.handle_failure(entry, &format!("deserialize event data: {e}"))
                    .await;
                return false;
            }
        };

        if let Err(e) = self.bus.publish_event(&event).await {
            self.handle_failure(entry, &e.to_string()).await;
            return false;
        }

        if let Err(e) = self.repository.mark_published(entry.id).await {
            // The event is out; the next tick may deliver it again.
            tracing::error!(
                entry_id = entry.id,
                event_id = %entry.event_id,
                code = e.code(),
                error = %e,
                "event published but status update failed; duplicate delivery possible"
            );
        }
        true
    }

    /// Schedule the retry, and archive the entry once it exhausts the
    /// budget.
    async fn handle_failure(&self, entry: &OutboxEntry, reason: &str) {
        let next_retry = entry.next_retry_time(self.config.retry_interval);
        if let Err(e) = self
            .repository
            .mark_failed(entry.id, reason, next_retry)
            .await
        {
            tracing::error!(
                entry_id = entry.id,
                code = e.code(),
                error = %e,
                "failed to record publish failure"
            );
        }

        let attempts = entry.retry_count + 1;
        if attempts < self.policy.max_retries {
            tracing::warn!(
                entry_id = entry.id,
                event_id = %entry.event_id,
                attempts,
                next_retry = %next_retry,
                reason,
                "publish failed; retry scheduled"
            );
            return;
        }

        let Some(dlq) = &self.dlq else {
            tracing::warn!(
                entry_id = entry.id,
                event_id = %entry.event_id,
                attempts,
                "entry exhausted retries and no DLQ is attached"
            );
            return;
        };

        let mut exhausted = entry.clone();
        exhausted.retry_count = attempts;
        exhausted.last_error = Some(reason.to_string());
        if let Err(e) = dlq.move_to_dlq(&exhausted).await {
            tracing::error!(
                entry_id = entry.id,
                code = e.code(),
                error = %e,
                "failed to move entry to dead-letter queue"
            );
        }
    }

    /// Delete published rows past the retention window.
    async fn cleanup_once(&self) {
        let cutoff = Utc::now() - self.config.retention_period;
        match self.repository.delete_published(cutoff).await {
            Ok(0) => {}
            Ok(deleted) => {
                tracing::info!(deleted, "published outbox entries cleaned up");
            }
            Err(e) => {
                tracing::error!(code = e.code(), error = %e, "outbox cleanup failed");
            }
        }
    }
}

/// Serial publisher: one loop ticking at the publish interval, with
/// retention cleanup interleaved on its own interval.
pub struct OutboxPublisher {
    core: PublisherCore,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl OutboxPublisher {
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        bus: Arc<dyn EventBus>,
        config: OutboxConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: PublisherCore::new(repository, bus, config),
            shutdown,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Attach a dead-letter queue for exhausted entries.
    pub fn with_dlq(mut self, dlq: Arc<dyn DlqRepository>) -> Self {
        self.core.dlq = Some(dlq);
        self
    }

    /// Launch the background loop.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("outbox publisher already running");
            return;
        }

        let core = self.core.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            tracing::info!(
                publish_interval = ?core.config.publish_interval,
                batch_size = core.config.batch_size,
                max_retries = core.config.max_retries,
                "outbox publisher started"
            );

            let mut publish_tick = interval(core.config.publish_interval);
            let mut cleanup_tick = interval(core.config.cleanup_interval);
            loop {
                tokio::select! {
                    _ = publish_tick.tick() => {
                        core.process_once().await;
                    }
                    _ = cleanup_tick.tick() => {
                        core.cleanup_once().await;
                    }
                    _ = shutdown.changed() => {
                        break;
                    }
                }
            }
            tracing::info!("outbox publisher stopped");
        });

        self.handles
            .lock()
            .expect("publisher handle lock poisoned")
            .push(handle);
    }

    /// Signal shutdown and wait for the loop to finish. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .expect("publisher handle lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Run one publish batch inline (manual trigger or tests).
    pub async fn process_once(&self) -> usize {
        self.core.process_once().await
    }

    /// Run one retention cleanup inline (manual trigger or tests).
    pub async fn cleanup_once(&self) {
        self.core.cleanup_once().await
    }
}

/// Parallel publisher: a fetch loop feeding a bounded channel drained by
/// a worker pool, with cleanup on a separate loop.
pub struct ParallelOutboxPublisher {
    core: PublisherCore,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl ParallelOutboxPublisher {
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        bus: Arc<dyn EventBus>,
        config: OutboxConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: PublisherCore::new(repository, bus, config),
            shutdown,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Attach a dead-letter queue for exhausted entries.
    pub fn with_dlq(mut self, dlq: Arc<dyn DlqRepository>) -> Self {
        self.core.dlq = Some(dlq);
        self
    }

    /// Launch the fetch loop, the worker pool, and the cleanup loop.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("parallel outbox publisher already running");
            return;
        }

        let worker_count = self.core.config.worker_count.max(1);
        let (tx, rx) = mpsc::channel::<OutboxEntry>(2 * worker_count);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = self
            .handles
            .lock()
            .expect("publisher handle lock poisoned");

        // Fetch loop; dropping `tx` on exit closes the channel so the
        // workers drain what is buffered and stop.
        let core = self.core.clone();
        let mut shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            tracing::info!(
                worker_count,
                batch_size = core.config.batch_size,
                "parallel outbox publisher started"
            );

            let mut publish_tick = interval(core.config.publish_interval);
            'outer: loop {
                let entries = tokio::select! {
                    _ = publish_tick.tick() => {
                        match core.repository.pending_entries(core.config.batch_size).await {
                            Ok(entries) => entries,
                            Err(e) => {
                                tracing::error!(code = e.code(), error = %e, "failed to fetch pending outbox entries");
                                continue;
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                };

                for entry in entries {
                    tokio::select! {
                        sent = tx.send(entry) => {
                            if sent.is_err() {
                                break 'outer;
                            }
                        }
                        _ = shutdown.changed() => break 'outer,
                    }
                }
            }
            tracing::info!("outbox fetch loop stopped");
        }));

        for worker_id in 0..worker_count {
            let core = self.core.clone();
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let entry = rx.lock().await.recv().await;
                    match entry {
                        Some(entry) => {
                            core.process_entry(&entry).await;
                        }
                        None => break,
                    }
                }
                tracing::debug!(worker_id, "outbox worker stopped");
            }));
        }

        // Cleanup loop
        let core = self.core.clone();
        let mut shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut cleanup_tick = interval(core.config.cleanup_interval);
            loop {
                tokio::select! {
                    _ = cleanup_tick.tick() => {
                        core.cleanup_once().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    /// Signal shutdown, let the workers drain, and wait for every task.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .expect("publisher handle lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("parallel outbox publisher stopped");
    }
}
