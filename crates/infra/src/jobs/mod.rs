//! Task dispatch: broker, priority scheduling, retries, dead letters and
//! the worker pool.
//!
//! ## Components
//!
//! - `Task`: name, payload, priority and retry bookkeeping
//! - `Broker`: lease-based hand-out with strict priority and FIFO bands
//! - `RetryController`: backoff via next-visible-at timestamps
//! - `DeadLetterRouter`: parks terminally failed tasks for inspection
//! - `WorkerPool`: threads that lease tasks and run registered handlers

pub mod broker;
pub mod dead_letter;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use broker::{Broker, BrokerError, BrokerStats, CancelOutcome, InMemoryBroker, Lease, NackAction};
pub use dead_letter::{
    DeadLetterEntry, DeadLetterRouter, DeadLetterStatus, DeadLetterStore, DeadLetterStoreError,
    FileDeadLetterStore, InMemoryDeadLetterStore, Page,
};
pub use registry::{HandlerOptions, HandlerRegistry, RegistryError, TaskHandler, TaskInvocation};
pub use retry::{RetryController, RetryDecision};
pub use scheduler::PriorityScheduler;
pub use types::{
    CancellationToken, RetryPolicy, Task, TaskAttemptRecord, TaskOutcome, TaskPayload, TaskState,
};
pub use worker::{ExecutionReport, ExecutionResult, WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats};
