//! The explicit context every component receives.
//!
//! Built once at start, shared as `Arc<CoreContext>`, torn down at
//! shutdown. There is no global state: two contexts in one process are fully
//! independent.

use std::sync::Arc;

use tracing::{debug, info, warn};

use jobforge_core::{CoreError, CoreResult, SharedClock, SystemClock};
use jobforge_events::{InMemoryEventBus, LifecycleEvent};
use jobforge_observability::Metrics;

use crate::config::CoreConfig;
use crate::idempotency::IdempotencyManager;
use crate::jobs::{
    Broker, DeadLetterRouter, DeadLetterStore, FileDeadLetterStore, HandlerRegistry,
    InMemoryBroker, InMemoryDeadLetterStore, RetryController, Task,
};
use crate::locking::OptimisticLockManager;
use crate::saga::{SagaDefinition, SagaOrchestrator};
use crate::shutdown::ShutdownCoordinator;
use crate::wal::{
    FileWalStorage, InMemoryWalStorage, ReplayDisposition, TASK_SUBMIT, WalEntry, WalStorage,
    WriteAheadLog,
};

pub struct CoreContext {
    pub config: CoreConfig,
    pub clock: SharedClock,
    pub metrics: Arc<Metrics>,
    pub events: Arc<InMemoryEventBus<LifecycleEvent>>,
    pub registry: Arc<HandlerRegistry>,
    pub broker: Arc<dyn Broker>,
    pub wal: Arc<WriteAheadLog>,
    pub dead_letters: Arc<DeadLetterRouter>,
    pub retry: Arc<RetryController>,
    pub idempotency: Arc<IdempotencyManager>,
    pub sagas: Arc<SagaOrchestrator>,
    /// Versioned shared records for handlers.
    pub locks: Arc<OptimisticLockManager<serde_json::Value>>,
    pub shutdown: Arc<ShutdownCoordinator>,
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("config", &self.config)
            .field("handlers", &self.registry.patterns())
            .field("shutdown", &self.shutdown.phase())
            .finish_non_exhaustive()
    }
}

impl CoreContext {
    /// Reject new work and wake idle workers. Safe to call more than once.
    pub fn teardown(&self) {
        self.broker.close();
        info!("core context torn down");
    }
}

/// Builds a [`CoreContext`]. Storages default to the configured file paths,
/// or to in-memory storage when no path is set.
pub struct CoreContextBuilder {
    config: CoreConfig,
    clock: Option<SharedClock>,
    metrics: Option<Arc<Metrics>>,
    registry: HandlerRegistry,
    sagas: Vec<SagaDefinition>,
    wal_storage: Option<Arc<dyn WalStorage>>,
    dead_letter_store: Option<Arc<dyn DeadLetterStore>>,
}

impl CoreContextBuilder {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            clock: None,
            metrics: None,
            registry: HandlerRegistry::new(),
            sagas: Vec::new(),
            wal_storage: None,
            dead_letter_store: None,
        }
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register a saga definition so interrupted runs can be resumed.
    pub fn saga(mut self, definition: SagaDefinition) -> Self {
        self.sagas.push(definition);
        self
    }

    pub fn wal_storage(mut self, storage: Arc<dyn WalStorage>) -> Self {
        self.wal_storage = Some(storage);
        self
    }

    pub fn dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letter_store = Some(store);
        self
    }

    pub fn build(self) -> CoreResult<Arc<CoreContext>> {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(Metrics::new()));
        let events = Arc::new(InMemoryEventBus::new());
        let registry = Arc::new(self.registry);

        let wal_storage: Arc<dyn WalStorage> = match (self.wal_storage, &config.wal_path) {
            (Some(storage), _) => storage,
            (None, Some(path)) => Arc::new(
                FileWalStorage::open(path).map_err(|e| CoreError::durability(e.to_string()))?,
            ),
            (None, None) => Arc::new(InMemoryWalStorage::new()),
        };
        let wal = Arc::new(WriteAheadLog::open(
            wal_storage,
            clock.clone(),
            metrics.clone(),
            config.wal_retention,
        )?);

        let dead_letter_store: Arc<dyn DeadLetterStore> =
            match (self.dead_letter_store, &config.dead_letter_path) {
                (Some(store), _) => store,
                (None, Some(path)) => Arc::new(FileDeadLetterStore::open(path)?),
                (None, None) => Arc::new(InMemoryDeadLetterStore::new()),
            };

        let broker: Arc<dyn Broker> = Arc::new(
            InMemoryBroker::new(clock.clone(), config.lease_duration, metrics.clone())
                .with_finished_retention(config.finished_retention),
        );
        let dead_letters = Arc::new(DeadLetterRouter::new(
            dead_letter_store,
            config.dead_letter_page_size,
            clock.clone(),
            events.clone(),
            metrics.clone(),
        ));
        let retry = Arc::new(RetryController::new(
            config.retry_policy.clone(),
            registry.clone(),
            dead_letters.clone(),
            events.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let owners = broker.clone();
        let idempotency = Arc::new(
            IdempotencyManager::new(
                clock.clone(),
                metrics.clone(),
                config.idempotency_ttl,
                config.idempotency_in_progress_ttl,
            )
            .with_owner_liveness(move |task_id| {
                owners
                    .get(task_id)
                    .ok()
                    .flatten()
                    .is_some_and(|task| !task.state.is_terminal())
            }),
        );

        let sagas = Arc::new(SagaOrchestrator::new(wal.clone(), clock.clone(), metrics.clone()));
        for definition in self.sagas {
            sagas.register(definition)?;
        }
        sagas.register_replay_handlers()?;

        register_submit_replay(&wal, broker.clone(), idempotency.clone())?;

        let ctx = CoreContext {
            locks: Arc::new(OptimisticLockManager::new(clock.clone(), metrics.clone())),
            shutdown: Arc::new(ShutdownCoordinator::new(
                config.drain_timeout,
                clock.clone(),
                metrics.clone(),
            )),
            config,
            clock,
            metrics,
            events,
            registry,
            broker,
            wal,
            dead_letters,
            retry,
            idempotency,
            sagas,
        };
        debug!(handlers = ?ctx.registry.patterns(), "core context built");
        Ok(Arc::new(ctx))
    }
}

/// A pending `task.submit` entry is a task that never reached a terminal
/// state: put it back in the broker. The entry stays pending until the task
/// finishes.
fn register_submit_replay(
    wal: &WriteAheadLog,
    broker: Arc<dyn Broker>,
    idempotency: Arc<IdempotencyManager>,
) -> CoreResult<()> {
    wal.register_replay_handler(TASK_SUBMIT, move |entry: &WalEntry| {
        let mut task = task_from_entry(entry)?;
        task.wal_sequence = Some(entry.sequence_number);

        if let Some(key) = task.idempotency_key.clone() {
            if let Err(e) = idempotency.begin(&key, task.id) {
                warn!(task_id = %task.id, key = %key, error = %e, "could not reclaim idempotency key");
            }
        }
        let task_id = broker.enqueue(task).map_err(|e| e.to_string())?;
        debug!(task_id = %task_id, sequence_number = entry.sequence_number, "task restored from wal");
        Ok(ReplayDisposition::Defer)
    })
}

pub(crate) fn task_from_entry(entry: &WalEntry) -> Result<Task, String> {
    let raw = entry
        .intended_effects
        .get("task")
        .cloned()
        .ok_or_else(|| format!("wal entry {} has no task", entry.sequence_number))?;
    serde_json::from_value(raw).map_err(|e| format!("wal entry {}: {e}", entry.sequence_number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{TaskOutcome, TaskPayload, TaskState};
    use crate::wal::WalRecord;
    use jobforge_core::Priority;
    use serde_json::json;

    #[test]
    fn pending_submissions_are_restored_on_replay() {
        let storage: Arc<dyn WalStorage> = Arc::new(InMemoryWalStorage::new());
        let task = Task::new("report", TaskPayload::default(), Priority::new(7).unwrap());
        {
            let wal = WriteAheadLog::open(
                storage.clone(),
                SystemClock::shared(),
                Arc::new(Metrics::new()),
                CoreConfig::default().wal_retention,
            )
            .unwrap();
            wal.append(
                WalRecord::new(TASK_SUBMIT, json!({ "task": task }))
                    .with_task(task.id),
            )
            .unwrap();
        }

        let mut registry = HandlerRegistry::new();
        registry
            .register("report", |_: &crate::jobs::TaskInvocation| TaskOutcome::Success(json!(null)))
            .unwrap();
        let ctx = CoreContextBuilder::new(CoreConfig::default())
            .registry(registry)
            .wal_storage(storage)
            .build()
            .unwrap();

        let report = ctx.wal.replay().unwrap();
        assert_eq!(report.deferred, 1);
        let restored = ctx.broker.get(task.id).unwrap().unwrap();
        assert_eq!(restored.state, TaskState::Queued);
        assert_eq!(restored.wal_sequence, Some(1));
        assert_eq!(ctx.wal.pending().unwrap().len(), 1);
    }

    #[test]
    fn teardown_closes_the_broker() {
        let ctx = CoreContextBuilder::new(CoreConfig::default()).build().unwrap();
        ctx.teardown();
        let task = Task::new("x", TaskPayload::default(), Priority::default());
        assert!(ctx.broker.enqueue(task).is_err());
    }
}
