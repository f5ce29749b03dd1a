//! Infrastructure of the job core: dispatch, durability, recovery, shutdown.
//!
//! Everything is wired through an explicit [`context::CoreContext`] built at
//! process start; no component reaches for global state.

pub mod config;
pub mod context;
pub mod idempotency;
pub mod jobs;
pub mod locking;
pub mod runtime;
pub mod saga;
pub mod service;
pub mod shutdown;
pub mod wal;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, CoreConfig};
pub use context::{CoreContext, CoreContextBuilder};
pub use runtime::Runtime;
pub use service::{SubmitRequest, Submission, TaskService};
