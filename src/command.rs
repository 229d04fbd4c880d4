//! Command service
//!
//! Maps command types to handlers, loads the target aggregate, runs the
//! handler under hooks, and saves the result. One service per aggregate
//! type, mirroring the repository it drives.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::aggregate::{Aggregate, AggregateRoot, SnapshotData};
use crate::error::{CoreError, CoreResult};
use crate::repository::AggregateRepository;

/// A request to change one aggregate.
///
/// `command_type` is the dispatch key; handlers recover their concrete
/// command through `as_any`.
pub trait Command: Any + Send + Sync {
    fn command_type(&self) -> &'static str;

    fn aggregate_id(&self) -> i64;

    fn as_any(&self) -> &dyn Any;
}

/// Executes one command against a loaded aggregate root, recording the
/// resulting events on it.
#[async_trait]
pub trait CommandHandler<A: Aggregate>: Send + Sync {
    async fn handle(
        &self,
        root: &mut AggregateRoot<A>,
        command: &dyn Command,
    ) -> CoreResult<()>;
}

/// Cross-cutting hooks around command execution.
///
/// `before` failures abort the command; `after` failures are logged and
/// never promoted.
#[async_trait]
pub trait CommandHook: Send + Sync {
    async fn before(&self, command: &dyn Command) -> CoreResult<()> {
        let _ = command;
        Ok(())
    }

    async fn after(&self, command: &dyn Command, outcome: &CoreResult<()>) -> CoreResult<()> {
        let _ = (command, outcome);
        Ok(())
    }
}

/// Command dispatch for one aggregate type.
pub struct CommandService<A: Aggregate> {
    repository: Arc<AggregateRepository<A>>,
    handlers: HashMap<&'static str, Arc<dyn CommandHandler<A>>>,
    hooks: Vec<Arc<dyn CommandHook>>,
}

impl<A: Aggregate + SnapshotData> CommandService<A> {
    pub fn new(repository: Arc<AggregateRepository<A>>) -> Self {
        Self {
            repository,
            handlers: HashMap::new(),
            hooks: Vec::new(),
        }
    }

    pub fn repository(&self) -> &Arc<AggregateRepository<A>> {
        &self.repository
    }

    /// Register a handler for a command type; re-registration replaces
    /// the previous handler.
    pub fn register_handler(
        &mut self,
        command_type: &'static str,
        handler: Arc<dyn CommandHandler<A>>,
    ) {
        if self.handlers.insert(command_type, handler).is_some() {
            tracing::debug!(command_type, "command handler replaced");
        }
    }

    /// Register a hook; hooks run in registration order.
    pub fn register_hook(&mut self, hook: Arc<dyn CommandHook>) {
        self.hooks.push(hook);
    }

    /// Dispatch a command to its handler and save the aggregate.
    pub async fn execute_command(&self, command: &dyn Command) -> CoreResult<()> {
        let started = Instant::now();
        let command_type = command.command_type();

        let result = self.run(command).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => {
                tracing::info!(command = command_type, elapsed_ms, "command executed");
            }
            Err(e) => {
                tracing::warn!(
                    command = command_type,
                    elapsed_ms,
                    code = e.code(),
                    error = %e,
                    "command failed"
                );
            }
        }
        result
    }

    async fn run(&self, command: &dyn Command) -> CoreResult<()> {
        let handler = self
            .handlers
            .get(command.command_type())
            .cloned()
            .ok_or_else(|| CoreError::HandlerNotFound(command.command_type().to_string()))?;

        let mut root = self.repository.get_by_id(command.aggregate_id()).await?;

        for hook in &self.hooks {
            hook.before(command).await?;
        }

        let outcome = handler.handle(&mut root, command).await;

        for hook in &self.hooks {
            if let Err(e) = hook.after(command, &outcome).await {
                tracing::warn!(
                    command = command.command_type(),
                    error = %e,
                    "after hook failed"
                );
            }
        }

        outcome?;

        let mut metadata = HashMap::new();
        metadata.insert(
            "command_type".to_string(),
            serde_json::json!(command.command_type()),
        );
        self.repository.save_with_metadata(&mut root, &metadata).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::repository::RepositoryBuilder;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Tally {
        total: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Bumped {
        by: i64,
    }

    impl Aggregate for Tally {
        type Event = Bumped;
        type Error = std::convert::Infallible;

        fn aggregate_type() -> &'static str {
            "Tally"
        }

        fn event_type(_: &Self::Event) -> &'static str {
            "Bumped"
        }

        fn apply(&mut self, event: &Self::Event) -> Result<(), Self::Error> {
            self.total += event.by;
            Ok(())
        }
    }

    impl SnapshotData for Tally {}

    struct Bump {
        id: i64,
        by: i64,
    }

    impl Command for Bump {
        fn command_type(&self) -> &'static str {
            "Bump"
        }

        fn aggregate_id(&self) -> i64 {
            self.id
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct BumpHandler;

    #[async_trait]
    impl CommandHandler<Tally> for BumpHandler {
        async fn handle(
            &self,
            root: &mut AggregateRoot<Tally>,
            command: &dyn Command,
        ) -> CoreResult<()> {
            let bump = command
                .as_any()
                .downcast_ref::<Bump>()
                .ok_or_else(|| CoreError::Validation("unexpected command type".to_string()))?;
            if bump.by < 0 {
                return Err(CoreError::Validation("cannot bump backwards".to_string()));
            }
            root.apply_and_record(Bumped { by: bump.by })
                .map_err(|e| CoreError::RepositoryFailed(e.to_string()))
        }
    }

    struct TraceHook {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_before: bool,
    }

    #[async_trait]
    impl CommandHook for TraceHook {
        async fn before(&self, _: &dyn Command) -> CoreResult<()> {
            self.log.lock().unwrap().push(format!("before:{}", self.name));
            if self.fail_before {
                return Err(CoreError::Validation("hook rejected".to_string()));
            }
            Ok(())
        }

        async fn after(&self, _: &dyn Command, outcome: &CoreResult<()>) -> CoreResult<()> {
            let tag = if outcome.is_ok() { "ok" } else { "err" };
            self.log
                .lock()
                .unwrap()
                .push(format!("after:{}:{}", self.name, tag));
            Ok(())
        }
    }

    fn service() -> CommandService<Tally> {
        let repository = Arc::new(
            RepositoryBuilder::<Tally>::new()
                .event_store(Arc::new(InMemoryEventStore::new()))
                .build()
                .unwrap(),
        );
        CommandService::new(repository)
    }

    #[tokio::test]
    async fn test_dispatch_and_save() {
        let mut service = service();
        service.register_handler("Bump", Arc::new(BumpHandler));

        service
            .execute_command(&Bump { id: 1, by: 4 })
            .await
            .unwrap();
        service
            .execute_command(&Bump { id: 1, by: 3 })
            .await
            .unwrap();

        let history = service.repository.event_history(1).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[0].metadata_str("command_type"),
            Some("Bump")
        );
    }

    #[tokio::test]
    async fn test_unregistered_command_fails() {
        let service = service();
        let err = service
            .execute_command(&Bump { id: 1, by: 4 })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "HANDLER_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_handler_failure_skips_save() {
        let mut service = service();
        service.register_handler("Bump", Arc::new(BumpHandler));

        let err = service
            .execute_command(&Bump { id: 1, by: -1 })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
        assert!(service.repository.event_history(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hooks_run_in_order_around_handler() {
        let mut service = service();
        service.register_handler("Bump", Arc::new(BumpHandler));

        let log = Arc::new(Mutex::new(Vec::new()));
        service.register_hook(Arc::new(TraceHook {
            name: "first",
            log: log.clone(),
            fail_before: false,
        }));
        service.register_hook(Arc::new(TraceHook {
            name: "second",
            log: log.clone(),
            fail_before: false,
        }));

        service
            .execute_command(&Bump { id: 1, by: 1 })
            .await
            .unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "before:first",
                "before:second",
                "after:first:ok",
                "after:second:ok"
            ]
        );

        // After hooks still run when the handler fails.
        log.lock().unwrap().clear();
        let _ = service.execute_command(&Bump { id: 1, by: -1 }).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "before:first",
                "before:second",
                "after:first:err",
                "after:second:err"
            ]
        );
    }

    #[tokio::test]
    async fn test_before_hook_error_aborts() {
        let mut service = service();
        service.register_handler("Bump", Arc::new(BumpHandler));

        let log = Arc::new(Mutex::new(Vec::new()));
        service.register_hook(Arc::new(TraceHook {
            name: "gate",
            log: log.clone(),
            fail_before: true,
        }));

        let err = service
            .execute_command(&Bump { id: 1, by: 1 })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
        assert!(service.repository.event_history(1).await.unwrap().is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["before:gate"]);
    }

    #[tokio::test]
    async fn test_duplicate_registration_overwrites() {
        struct Doubling;

        #[async_trait]
        impl CommandHandler<Tally> for Doubling {
            async fn handle(
                &self,
                root: &mut AggregateRoot<Tally>,
                command: &dyn Command,
            ) -> CoreResult<()> {
                let bump = command.as_any().downcast_ref::<Bump>().unwrap();
                root.apply_and_record(Bumped { by: bump.by * 2 })
                    .map_err(|e| CoreError::RepositoryFailed(e.to_string()))
            }
        }

        let mut service = service();
        service.register_handler("Bump", Arc::new(BumpHandler));
        service.register_handler("Bump", Arc::new(Doubling));

        service
            .execute_command(&Bump { id: 1, by: 4 })
            .await
            .unwrap();
        let root = service.repository.get_by_id(1).await.unwrap();
        assert_eq!(root.state().total, 8);
    }
}
