//! Core task types and policies.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use jobforge_core::{CoreError, CoreResult, Priority, TaskId};

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// In a priority band, waiting for a lease.
    Queued,
    /// Leased by a worker.
    Executing,
    /// Finished successfully.
    Succeeded,
    /// Failed at least once; waiting for its next-visible-at time.
    Retrying,
    /// Retries exhausted; parked in the dead-letter store.
    DeadLettered,
    /// Cancelled before it was leased (or cooperatively while executing).
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::DeadLettered | TaskState::Cancelled
        )
    }

    /// Allowed transitions. Terminal states never move again.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Executing)
                | (Queued, Cancelled)
                | (Retrying, Executing)
                | (Retrying, Cancelled)
                | (Executing, Succeeded)
                | (Executing, Retrying)
                | (Executing, DeadLettered)
                | (Executing, Cancelled)
                // redelivery after lease expiry or shutdown interruption
                | (Executing, Queued)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Executing => "executing",
            TaskState::Succeeded => "succeeded",
            TaskState::Retrying => "retrying",
            TaskState::DeadLettered => "dead_lettered",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Positional and keyword arguments of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskPayload {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }
}

/// Retry policy: `delay = base_delay * factor^(attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor between consecutive retries (1 = fixed delay).
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            factor: 1,
        }
    }

    /// Create a policy with exponential backoff (factor 2).
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            factor: 2,
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let multiplier = self
            .factor
            .max(1)
            .checked_pow(attempt - 1)
            .unwrap_or(u32::MAX);

        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether a task that has already been retried `retry_count` times may
    /// be retried again.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

/// Cooperative cancellation flag shared between the broker, the shutdown
/// coordinator and the running handler.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A background task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Handler name used for routing.
    pub name: String,
    pub payload: TaskPayload,
    pub priority: Priority,
    pub idempotency_key: Option<String>,
    /// Retries consumed so far (first attempt is not a retry).
    pub retry_count: u32,
    pub max_retries: u32,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the task may be leased again (retry backoff).
    pub visible_at: Option<DateTime<Utc>>,
    /// WAL entry recording this task's submission.
    pub wal_sequence: Option<u64>,
    pub last_error: Option<String>,
    /// Execution history (one record per finished attempt).
    pub history: Vec<TaskAttemptRecord>,
}

/// Record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Task {
    pub fn new(name: impl Into<String>, payload: TaskPayload, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            name: name.into(),
            payload,
            priority,
            idempotency_key: None,
            retry_count: 0,
            max_retries: RetryPolicy::default().max_retries,
            state: TaskState::Queued,
            created_at: now,
            updated_at: now,
            visible_at: None,
            wal_sequence: None,
            last_error: None,
            history: Vec::new(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Current attempt number (1 for the first execution).
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        match self.visible_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    fn transition(&mut self, next: TaskState, now: DateTime<Utc>) -> CoreResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::validation(format!(
                "task {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    fn record_attempt(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>, error: Option<String>) {
        self.history.push(TaskAttemptRecord {
            attempt: self.attempt(),
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    pub fn mark_executing(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.transition(TaskState::Executing, now)?;
        self.visible_at = None;
        Ok(())
    }

    pub fn mark_succeeded(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>) -> CoreResult<()> {
        self.transition(TaskState::Succeeded, now)?;
        self.record_attempt(started_at, now, None);
        Ok(())
    }

    /// Consume one retry and hide the task until `visible_at`.
    ///
    /// Fails if the task has no retries left; `retry_count` never exceeds
    /// `max_retries`.
    pub fn mark_retrying(
        &mut self,
        error: String,
        started_at: DateTime<Utc>,
        visible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        if self.retry_count >= self.max_retries {
            return Err(CoreError::validation(format!(
                "task {} has no retries left ({}/{})",
                self.id, self.retry_count, self.max_retries
            )));
        }
        self.transition(TaskState::Retrying, now)?;
        self.record_attempt(started_at, now, Some(error.clone()));
        self.retry_count += 1;
        self.visible_at = Some(visible_at);
        self.last_error = Some(error);
        Ok(())
    }

    pub fn mark_dead_lettered(
        &mut self,
        error: String,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.transition(TaskState::DeadLettered, now)?;
        self.record_attempt(started_at, now, Some(error.clone()));
        self.last_error = Some(error);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.transition(TaskState::Cancelled, now)?;
        self.visible_at = None;
        Ok(())
    }

    /// Return an executing task to its band for redelivery. Does not consume
    /// a retry.
    pub fn mark_requeued(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.transition(TaskState::Queued, now)
    }
}

/// Result of running a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Completed; the value is cached for idempotent resubmissions.
    Success(Value),
    /// Failed; goes through the retry path.
    Failure(String),
    /// Failed; retry after this delay instead of the policy's backoff.
    RetryAfter { delay: Duration, reason: String },
    /// The handler observed its cancellation flag and stopped early.
    Interrupted,
}
