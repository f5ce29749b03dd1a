//! Write-ahead log: intended effects are durable before they are applied.
//!
//! Task submissions are logged as `task.submit` and stay pending until the
//! task reaches a terminal state, which makes the log the durability layer
//! for queued work. Saga steps are logged as `saga.*`, correlated by saga id.

mod file;
mod log;
mod storage;
mod types;

pub use file::FileWalStorage;
pub use log::{ReplayHandler, WriteAheadLog};
#[cfg(test)]
pub(crate) use storage::FlakyWalStorage;
pub use storage::{InMemoryWalStorage, WalSnapshot, WalStorage, WalStorageError};
pub use types::{CheckpointReport, ReplayDisposition, ReplayReport, WalEntry, WalRecord, WalStatus};

/// Kind of the entry written for every accepted task submission.
pub const TASK_SUBMIT: &str = "task.submit";
