//! Lifecycle events emitted for every task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jobforge_core::{Priority, TaskId};

/// What happened to the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEventKind {
    /// Accepted and enqueued.
    Submitted { priority: Priority },
    /// First failure; a retry has been scheduled. Emitted once per task.
    Retrying {
        attempt: u32,
        delay_ms: u64,
        visible_at: DateTime<Utc>,
    },
    /// Handler finished successfully.
    Succeeded { attempts: u32 },
    /// Retries exhausted; the task was dead-lettered.
    FailedTerminal { attempts: u32, error: String },
    /// Cancelled before it was leased.
    Cancelled,
}

impl LifecycleEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEventKind::Submitted { .. } => "submitted",
            LifecycleEventKind::Retrying { .. } => "retrying",
            LifecycleEventKind::Succeeded { .. } => "succeeded",
            LifecycleEventKind::FailedTerminal { .. } => "failed_terminal",
            LifecycleEventKind::Cancelled => "cancelled",
        }
    }
}

/// A lifecycle event with its task metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_id: Uuid,
    pub task_id: TaskId,
    pub task_name: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: LifecycleEventKind,
}

impl LifecycleEvent {
    pub fn new(
        task_id: TaskId,
        task_name: impl Into<String>,
        occurred_at: DateTime<Utc>,
        kind: LifecycleEventKind,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            task_id,
            task_name: task_name.into(),
            occurred_at,
            kind,
        }
    }
}
