//! Error taxonomy of the job core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::{SagaId, TaskId};
use crate::version::ExpectedVersion;

/// Result type used across the job core.
pub type CoreResult<T> = Result<T, CoreError>;

/// A compensation that failed while unwinding a saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCompensation {
    pub step: String,
    pub error: String,
}

/// Core-level error.
///
/// Each variant maps to one handling policy:
/// - `Transient`: recovered locally by the retry path
/// - `VersionConflict`: surfaced to the caller, never retried by the core
/// - `CompensationFailure`: terminal, needs an operator
/// - `TerminalTaskFailure`: retries exhausted, routed to the dead-letter store
/// - `Durability`: a WAL append failed; the caller must fail closed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Broker/storage unavailable or similar temporary condition.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Optimistic concurrency check failed.
    #[error(
        "version conflict on '{resource_id}' (expected: {expected:?}, actual: {actual})"
    )]
    VersionConflict {
        resource_id: String,
        expected: ExpectedVersion,
        actual: u64,
    },

    /// One or more saga compensations failed; system state is inconsistent.
    #[error("saga {saga_id} compensation failed after '{cause}': {failures:?}")]
    CompensationFailure {
        saga_id: SagaId,
        cause: String,
        failures: Vec<FailedCompensation>,
    },

    /// A task exhausted its retries.
    #[error("task {task_id} failed after {attempts} attempts: {reason}")]
    TerminalTaskFailure {
        task_id: TaskId,
        attempts: u32,
        reason: String,
    },

    /// An intended effect could not be made durable.
    #[error("durability failure: {0}")]
    Durability(String),

    /// Invalid input or configuration (e.g. priority out of range).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Coarse error classification, used as a metrics label.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    VersionConflict,
    CompensationFailure,
    TerminalTaskFailure,
    DurabilityFailure,
    Validation,
    NotFound,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::VersionConflict => "version_conflict",
            ErrorKind::CompensationFailure => "compensation_failure",
            ErrorKind::TerminalTaskFailure => "terminal_task_failure",
            ErrorKind::DurabilityFailure => "durability_failure",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CoreError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn durability(msg: impl Into<String>) -> Self {
        Self::Durability(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Transient(_) => ErrorKind::Transient,
            CoreError::VersionConflict { .. } => ErrorKind::VersionConflict,
            CoreError::CompensationFailure { .. } => ErrorKind::CompensationFailure,
            CoreError::TerminalTaskFailure { .. } => ErrorKind::TerminalTaskFailure,
            CoreError::Durability(_) => ErrorKind::DurabilityFailure,
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// Whether the retry path may recover from this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }
}
