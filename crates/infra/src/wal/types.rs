//! WAL records and entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use jobforge_core::TaskId;

/// Whether the effect described by an entry has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalStatus {
    Pending,
    Committed,
}

/// An intended effect, before the log assigns it a sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Selects the replay handler, e.g. `task.submit` or `saga.step`.
    pub kind: String,
    pub task_id: Option<TaskId>,
    /// Groups related entries (a saga's steps, for instance).
    pub correlation_id: Option<String>,
    pub intended_effects: Value,
}

impl WalRecord {
    pub fn new(kind: impl Into<String>, intended_effects: Value) -> Self {
        Self {
            kind: kind.into(),
            task_id: None,
            correlation_id: None,
            intended_effects,
        }
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// A logged record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Strictly increasing, starting at 1.
    pub sequence_number: u64,
    pub kind: String,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub intended_effects: Value,
    pub status: WalStatus,
    pub appended_at: DateTime<Utc>,
    #[serde(default)]
    pub committed_at: Option<DateTime<Utc>>,
    /// Optional outcome recorded at commit time.
    #[serde(default)]
    pub result: Option<Value>,
}

impl WalEntry {
    pub fn from_record(sequence_number: u64, record: WalRecord, appended_at: DateTime<Utc>) -> Self {
        Self {
            sequence_number,
            kind: record.kind,
            task_id: record.task_id,
            correlation_id: record.correlation_id,
            intended_effects: record.intended_effects,
            status: WalStatus::Pending,
            appended_at,
            committed_at: None,
            result: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == WalStatus::Pending
    }

    pub(crate) fn mark_committed(&mut self, at: DateTime<Utc>, result: Option<Value>) {
        self.status = WalStatus::Committed;
        self.committed_at = Some(at);
        if result.is_some() {
            self.result = result;
        }
    }
}

/// What a replay handler did with a pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDisposition {
    /// The effect was re-applied; commit the entry now.
    Commit,
    /// The effect was restored but is owned elsewhere (a re-enqueued task);
    /// the entry stays pending until its owner commits it.
    Defer,
}

/// Summary of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Pending entries seen.
    pub total: usize,
    pub applied: usize,
    pub deferred: usize,
    /// No handler registered, or already replayed by this process.
    pub skipped: usize,
    pub failed: usize,
}

/// Summary of one checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointReport {
    pub reclaimed: usize,
    pub retained: usize,
    pub pending: usize,
}
