//! Public task API: submit, inspect, cancel, and manage dead letters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use jobforge_core::{CoreError, CoreResult, Priority, TaskId};
use jobforge_events::{EventBus, LifecycleEvent, LifecycleEventKind};
use jobforge_observability::names;

use crate::context::CoreContext;
use crate::idempotency::{BeginOutcome, fingerprint};
use crate::jobs::{CancelOutcome, DeadLetterEntry, Page, Task, TaskPayload, TaskState};
use crate::wal::{ReplayReport, TASK_SUBMIT, WalEntry, WalRecord};

/// A task submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// 0..=9; higher runs first.
    pub priority: i64,
    pub idempotency_key: Option<String>,
    /// Overrides the handler's retry policy.
    pub max_retries: Option<u32>,
}

impl SubmitRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            priority: Priority::DEFAULT.value() as i64,
            idempotency_key: None,
            max_retries: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Result of [`TaskService::submit`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    /// For a duplicate, the task id of the original submission.
    pub task_id: TaskId,
    pub duplicate: bool,
    /// The original's result, when it already finished.
    pub cached_result: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct TaskService {
    ctx: Arc<CoreContext>,
}

impl TaskService {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<CoreContext> {
        &self.ctx
    }

    /// Accept a task.
    ///
    /// The submission is durable in the WAL before it is enqueued; if the
    /// WAL append fails nothing is enqueued and the error is returned. A
    /// repeated idempotency key returns the original task id.
    pub fn submit(&self, request: SubmitRequest) -> CoreResult<Submission> {
        let ctx = &self.ctx;
        if ctx.shutdown.is_draining() {
            return Err(CoreError::transient("shutting down, submission rejected"));
        }
        let priority = Priority::new(request.priority)?;
        if !ctx.registry.contains(&request.name) {
            return Err(CoreError::validation(format!(
                "no handler registered for task '{}'",
                request.name
            )));
        }

        let max_retries = request
            .max_retries
            .unwrap_or_else(|| ctx.retry.policy_for(&request.name).max_retries);
        let mut task = Task::new(
            request.name,
            TaskPayload::new(request.args, request.kwargs),
            priority,
        )
        .with_max_retries(max_retries)
        .created_at(ctx.clock.now());

        if let Some(key) = request.idempotency_key {
            let request_fingerprint = fingerprint(&json!({
                "name": task.name,
                "args": task.payload.args,
                "kwargs": task.payload.kwargs,
            }));
            match ctx
                .idempotency
                .begin_with_fingerprint(&key, task.id, &request_fingerprint)?
            {
                BeginOutcome::New => {}
                BeginOutcome::InProgress { owner } => {
                    info!(key = %key, task_id = %owner, "duplicate submission, original still running");
                    return Ok(Submission {
                        task_id: owner,
                        duplicate: true,
                        cached_result: None,
                    });
                }
                BeginOutcome::Completed { owner, result } => {
                    info!(key = %key, task_id = %owner, "duplicate submission, returning cached result");
                    return Ok(Submission {
                        task_id: owner,
                        duplicate: true,
                        cached_result: Some(result),
                    });
                }
            }
            task = task.with_idempotency_key(key);
        }

        let (key, task_id) = (task.idempotency_key.clone(), task.id);
        match self.admit(task) {
            Ok(task_id) => Ok(Submission {
                task_id,
                duplicate: false,
                cached_result: None,
            }),
            Err(e) => {
                if let Some(key) = key {
                    ctx.idempotency.release(&key, task_id)?;
                }
                Err(e)
            }
        }
    }

    /// Log then enqueue.
    fn admit(&self, mut task: Task) -> CoreResult<TaskId> {
        let ctx = &self.ctx;
        let started = Instant::now();

        let snapshot = serde_json::to_value(&task)
            .map_err(|e| CoreError::validation(format!("task is not serializable: {e}")))?;
        let sequence = ctx
            .wal
            .append(WalRecord::new(TASK_SUBMIT, json!({ "task": snapshot })).with_task(task.id))?;
        task.wal_sequence = Some(sequence);

        let (task_id, name, priority) = (task.id, task.name.clone(), task.priority);
        if let Err(e) = ctx.broker.enqueue(task) {
            warn!(task_id = %task_id, error = %e, "enqueue failed after wal append");
            ctx.wal
                .commit_with_result(sequence, json!({ "status": "aborted", "error": e.to_string() }))?;
            return Err(e.into());
        }

        ctx.metrics.incr_labeled(names::TASKS_SUBMITTED, &name);
        ctx.metrics.observe(names::STAGE_ENQUEUE, started.elapsed());
        self.publish(task_id, &name, LifecycleEventKind::Submitted { priority });
        info!(task_id = %task_id, task_name = %name, priority = priority.value(), "task submitted");
        Ok(task_id)
    }

    fn publish(&self, task_id: TaskId, name: &str, kind: LifecycleEventKind) {
        let event = LifecycleEvent::new(task_id, name, self.ctx.clock.now(), kind);
        if let Err(e) = self.ctx.events.publish(event) {
            warn!(task_id = %task_id, error = ?e, "failed to publish lifecycle event");
        }
    }

    /// Current state. Once the broker has dropped a finished record the
    /// dead-letter store and then the task's committed WAL entry answer.
    pub fn get_status(&self, task_id: TaskId) -> CoreResult<TaskState> {
        if let Some(task) = self.ctx.broker.get(task_id)? {
            return Ok(task.state);
        }
        if self.ctx.dead_letters.get(task_id)?.is_some() {
            return Ok(TaskState::DeadLettered);
        }
        self.ctx
            .wal
            .latest_for_task(TASK_SUBMIT, task_id)?
            .and_then(|entry| recorded_outcome(&entry))
            .ok_or_else(|| CoreError::not_found(format!("task {task_id}")))
    }

    pub fn get_task(&self, task_id: TaskId) -> CoreResult<Task> {
        self.ctx
            .broker
            .get(task_id)?
            .ok_or_else(|| CoreError::not_found(format!("task {task_id}")))
    }

    /// The handler's return value, while the task's WAL entry is retained.
    pub fn result(&self, task_id: TaskId) -> CoreResult<Option<Value>> {
        let entry = match self.ctx.broker.get(task_id)? {
            Some(task) if task.state != TaskState::Succeeded => return Ok(None),
            Some(task) => match task.wal_sequence {
                Some(seq) => self.ctx.wal.get(seq)?,
                None => return Ok(None),
            },
            None => {
                let entry = self.ctx.wal.latest_for_task(TASK_SUBMIT, task_id)?;
                if entry.is_none() && self.ctx.dead_letters.get(task_id)?.is_none() {
                    return Err(CoreError::not_found(format!("task {task_id}")));
                }
                entry
            }
        };
        Ok(entry
            .filter(|e| recorded_outcome(e) == Some(TaskState::Succeeded))
            .and_then(|e| e.result)
            .and_then(|r| r.get("result").cloned()))
    }

    /// Cancel a task. A queued task is removed at once; an executing one has
    /// its cancellation flag raised and stops when its handler notices.
    pub fn cancel(&self, task_id: TaskId) -> CoreResult<CancelOutcome> {
        let ctx = &self.ctx;
        let known = ctx.broker.get(task_id)?;
        let outcome = ctx.broker.cancel(task_id)?;
        match outcome {
            CancelOutcome::Cancelled => {
                let task = known.ok_or_else(|| CoreError::not_found(format!("task {task_id}")))?;
                if let Some(seq) = task.wal_sequence {
                    ctx.wal
                        .commit_with_result(seq, json!({ "status": "cancelled" }))?;
                }
                if let Some(key) = &task.idempotency_key {
                    ctx.idempotency.release(key, task_id)?;
                }
                ctx.metrics.incr(names::TASKS_CANCELLED);
                self.publish(task_id, &task.name, LifecycleEventKind::Cancelled);
                info!(task_id = %task_id, task_name = %task.name, "task cancelled");
            }
            CancelOutcome::Signalled => {
                info!(task_id = %task_id, "cancellation signalled to running task");
            }
            CancelOutcome::AlreadyFinished => {}
        }
        Ok(outcome)
    }

    /// Block until the task reaches a terminal state.
    ///
    /// A dead-lettered task is a `TerminalTaskFailure`; running past
    /// `timeout` is `Transient`.
    pub fn wait_for(&self, task_id: TaskId, timeout: Duration) -> CoreResult<TaskState> {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(task) = self.ctx.broker.get(task_id)? else {
                return self.finished_state(task_id);
            };
            match task.state {
                TaskState::DeadLettered => {
                    return Err(CoreError::TerminalTaskFailure {
                        task_id,
                        attempts: task.retry_count + 1,
                        reason: task.last_error.unwrap_or_default(),
                    });
                }
                state if state.is_terminal() => return Ok(state),
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(CoreError::transient(format!(
                    "task {task_id} still {} after {}ms",
                    task.state,
                    timeout.as_millis()
                )));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Outcome of a task whose broker record is gone.
    fn finished_state(&self, task_id: TaskId) -> CoreResult<TaskState> {
        if let Some(entry) = self.ctx.dead_letters.get(task_id)? {
            return Err(CoreError::TerminalTaskFailure {
                task_id,
                attempts: entry.retries + 1,
                reason: entry.exception_summary,
            });
        }
        self.get_status(task_id)
    }

    /// One page (1-based) of dead-lettered tasks, oldest first.
    pub fn list_dead_letters(&self, page: usize) -> CoreResult<Page<DeadLetterEntry>> {
        self.ctx.dead_letters.list(page)
    }

    /// Resubmit a dead-lettered task as a fresh task with a new id and zero
    /// retries. The entry leaves the store only once the resubmission is
    /// durable.
    pub fn retry_dead_letter(&self, task_id: TaskId) -> CoreResult<TaskId> {
        let entry = self
            .ctx
            .dead_letters
            .get(task_id)?
            .ok_or_else(|| CoreError::not_found(format!("dead letter {task_id}")))?;
        if !self.ctx.registry.contains(&entry.task_name) {
            return Err(CoreError::validation(format!(
                "no handler registered for task '{}'",
                entry.task_name
            )));
        }
        let max_retries = self.ctx.retry.policy_for(&entry.task_name).max_retries;
        self.ctx
            .dead_letters
            .retry(&entry, max_retries, |task| self.admit(task))
    }

    /// Replay pending WAL entries (restores queued work after a restart).
    pub fn recover(&self) -> CoreResult<ReplayReport> {
        self.ctx.wal.replay()
    }
}

/// The terminal state a task's committed WAL entry records.
fn recorded_outcome(entry: &WalEntry) -> Option<TaskState> {
    match entry.result.as_ref()?.get("status")?.as_str()? {
        "succeeded" => Some(TaskState::Succeeded),
        "dead_lettered" => Some(TaskState::DeadLettered),
        "cancelled" => Some(TaskState::Cancelled),
        _ => None,
    }
}
