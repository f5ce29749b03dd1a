//! Worker pool: leases tasks from the broker and runs their handlers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use jobforge_core::{CoreError, CoreResult, TaskId, WorkerId};
use jobforge_events::{EventBus, LifecycleEvent, LifecycleEventKind};
use jobforge_observability::names;

use crate::context::CoreContext;

use super::broker::{BrokerError, Lease, NackAction};
use super::registry::TaskInvocation;
use super::retry::RetryDecision;
use super::types::{Task, TaskOutcome};

/// How long an interrupted handler gets to return on its own before the
/// worker abandons it.
const INTERRUPT_GRACE: Duration = Duration::from_millis(100);
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Longest a worker blocks on an empty queue before re-checking shutdown.
    pub poll_interval: Duration,
    /// Name prefix for threads and logs.
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(100),
            name: "jobforge-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_retried: u64,
    pub tasks_dead_lettered: u64,
    pub tasks_cancelled: u64,
    /// Outcomes dropped because the lease was lost (expiry or shutdown).
    pub outcomes_discarded: u64,
    pub current_running: usize,
}

/// What happened to one leased task.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Succeeded(Value),
    RetryScheduled { attempt: u32, delay: Duration },
    DeadLettered,
    Cancelled,
    /// Handed back without consuming a retry.
    Requeued,
    /// The lease was no longer held; the outcome was dropped.
    Discarded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub task_id: TaskId,
    pub task_name: String,
    pub attempt: u32,
    pub result: ExecutionResult,
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    stop: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerPoolHandle {
    /// Ask every worker to exit after its current task.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for all workers to exit and return the final statistics.
    pub fn join(mut self) -> WorkerStats {
        for join in self.joins.drain(..) {
            if join.join().is_err() {
                error!("worker thread panicked");
            }
        }
        self.stats()
    }

    pub fn stats(&self) -> WorkerStats {
        match self.stats.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.joins.len()
    }
}

/// Pool of worker threads sharing one broker.
#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(ctx: Arc<CoreContext>, config: WorkerPoolConfig) -> CoreResult<WorkerPoolHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let mut joins = Vec::with_capacity(config.workers);

        for index in 0..config.workers.max(1) {
            let name = format!("{}-{}", config.name, index);
            let ctx = ctx.clone();
            let stop = stop.clone();
            let stats = stats.clone();
            let poll_interval = config.poll_interval;
            let thread_name = name.clone();
            let join = thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker_loop(ctx, name, poll_interval, stop, stats))
                .map_err(|e| CoreError::transient(format!("failed to spawn worker thread: {e}")))?;
            joins.push(join);
        }

        info!(pool = %config.name, workers = joins.len(), "worker pool started");
        Ok(WorkerPoolHandle { stop, joins, stats })
    }

    /// Lease and run a single task on the calling thread (tests, CLI drains).
    pub fn run_once(
        ctx: &Arc<CoreContext>,
        worker: WorkerId,
        wait: Duration,
    ) -> CoreResult<Option<ExecutionReport>> {
        match ctx.broker.dequeue(worker, wait)? {
            Some(lease) => Ok(Some(execute_lease(ctx, "inline", &lease)?)),
            None => Ok(None),
        }
    }
}

fn worker_loop(
    ctx: Arc<CoreContext>,
    name: String,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    let worker_id = WorkerId::new();
    info!(worker = %name, worker_id = %worker_id, "worker started");

    loop {
        if stop.load(Ordering::SeqCst) || ctx.shutdown.is_draining() {
            break;
        }

        match ctx.broker.dequeue(worker_id, poll_interval) {
            Ok(Some(lease)) => {
                // Shutdown may have started while we were blocked.
                if ctx.shutdown.is_draining() {
                    if let Err(e) = ctx.broker.revoke(&lease) {
                        warn!(worker = %name, task_id = %lease.task_id, error = %e, "failed to hand back lease");
                    }
                    break;
                }

                update_stats(&stats, |s| s.current_running += 1);
                let report = execute_lease(&ctx, &name, &lease);
                update_stats(&stats, |s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.tasks_processed += 1;
                    if let Ok(report) = &report {
                        match report.result {
                            ExecutionResult::Succeeded(_) => s.tasks_succeeded += 1,
                            ExecutionResult::RetryScheduled { .. } => s.tasks_retried += 1,
                            ExecutionResult::DeadLettered => s.tasks_dead_lettered += 1,
                            ExecutionResult::Cancelled => s.tasks_cancelled += 1,
                            ExecutionResult::Discarded => s.outcomes_discarded += 1,
                            ExecutionResult::Requeued => {}
                        }
                    }
                });

                if let Err(e) = report {
                    ctx.metrics.incr_labeled(names::ERRORS, e.kind().as_str());
                    error!(worker = %name, task_id = %lease.task_id, error = %e, "task execution failed");
                }
            }
            Ok(None) => {}
            Err(BrokerError::Closed) => break,
            Err(e) => {
                error!(worker = %name, error = %e, "failed to lease task");
                thread::sleep(poll_interval);
            }
        }
    }

    info!(worker = %name, "worker stopped");
}

fn update_stats(stats: &Mutex<WorkerStats>, f: impl FnOnce(&mut WorkerStats)) {
    match stats.lock() {
        Ok(mut s) => f(&mut s),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

enum Execution {
    Finished(TaskOutcome),
    /// Ran past its timeout. Reported only once the handler thread has
    /// returned, so the retry never overlaps it.
    TimedOut(Duration),
    /// Left running without settling: it ignored a shutdown interrupt past
    /// the grace period, or its lease was lost.
    Abandoned(&'static str),
}

/// Run the handler for `lease` and settle the outcome with the broker.
fn execute_lease(ctx: &Arc<CoreContext>, worker: &str, lease: &Lease) -> CoreResult<ExecutionReport> {
    let _in_flight = ctx.shutdown.track(lease);
    let task = ctx
        .broker
        .get(lease.task_id)?
        .ok_or_else(|| CoreError::not_found(format!("task {}", lease.task_id)))?;

    debug!(worker = %worker, task_id = %task.id, task_name = %task.name, attempt = task.attempt(), "task leased");

    let started = Instant::now();
    let execution = match ctx.registry.resolve(&task.name) {
        Some(registration) => {
            let timeout = registration.options.timeout.unwrap_or(ctx.config.task_timeout);
            run_handler(ctx, worker, lease, &task, registration.handler.clone(), timeout)
        }
        None => Execution::Finished(TaskOutcome::Failure(format!(
            "no handler registered for task '{}'",
            task.name
        ))),
    };
    ctx.metrics.observe(names::STAGE_EXECUTE, started.elapsed());

    let result = match execution {
        Execution::Finished(TaskOutcome::Success(value)) => settle_success(ctx, lease, &task, value)?,
        Execution::Finished(TaskOutcome::Failure(error)) => settle_failure(ctx, lease, &task, &error, None)?,
        Execution::Finished(TaskOutcome::RetryAfter { delay, reason }) => {
            settle_failure(ctx, lease, &task, &reason, Some(delay))?
        }
        Execution::Finished(TaskOutcome::Interrupted) => settle_interrupted(ctx, lease, &task)?,
        Execution::TimedOut(after) => {
            let error = format!("task timed out after {}ms", after.as_millis());
            settle_failure(ctx, lease, &task, &error, None)?
        }
        Execution::Abandoned(reason) => {
            warn!(worker = %worker, task_id = %task.id, reason, "handler abandoned");
            ExecutionResult::Discarded
        }
    };

    Ok(ExecutionReport {
        task_id: task.id,
        task_name: task.name,
        attempt: task.retry_count + 1,
        result,
    })
}

fn run_handler(
    ctx: &Arc<CoreContext>,
    worker: &str,
    lease: &Lease,
    task: &Task,
    handler: super::registry::TaskHandler,
    timeout: Duration,
) -> Execution {
    let invocation = TaskInvocation::new(task.clone(), lease.cancel.clone(), ctx.clone());
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("{worker}-task"))
        .spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&invocation)))
                .unwrap_or_else(|_| TaskOutcome::Failure("handler panicked".to_string()));
            let _ = tx.send(outcome);
        });
    if let Err(e) = spawned {
        return Execution::Finished(TaskOutcome::Failure(format!("failed to start handler: {e}")));
    }

    let started = Instant::now();
    let renew_every = ctx.config.lease_duration / 3;
    let mut timed_out = false;
    let mut renewed_at: Option<Instant> = None;
    let mut interrupted_at: Option<Instant> = None;
    loop {
        match rx.recv_timeout(WAIT_SLICE) {
            Ok(_) | Err(mpsc::RecvTimeoutError::Disconnected) if timed_out => {
                return Execution::TimedOut(timeout);
            }
            Ok(outcome) => return Execution::Finished(outcome),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Execution::Finished(TaskOutcome::Failure(
                    "handler exited without a result".to_string(),
                ));
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        if !timed_out && started.elapsed() >= timeout {
            lease.cancel.cancel();
            timed_out = true;
            warn!(
                worker = %worker,
                task_id = %task.id,
                timeout_ms = timeout.as_millis() as u64,
                "handler timed out, holding its lease until it returns"
            );
        }

        // A timed-out handler may ignore its cancellation flag; its lease
        // must not lapse while the thread still runs.
        if timed_out && renewed_at.is_none_or(|at| at.elapsed() >= renew_every) {
            match ctx.broker.renew(lease) {
                Ok(true) => renewed_at = Some(Instant::now()),
                Ok(false) => return Execution::Abandoned("lease lost while handler ran past its timeout"),
                Err(e) => {
                    error!(worker = %worker, task_id = %task.id, error = %e, "lease renewal failed");
                    return Execution::Abandoned("lease renewal failed");
                }
            }
        }

        if lease.cancel.is_cancelled() && ctx.shutdown.is_draining() {
            let since = *interrupted_at.get_or_insert_with(Instant::now);
            if since.elapsed() >= INTERRUPT_GRACE {
                return Execution::Abandoned("interrupted handler did not return");
            }
        }
    }
}

fn settle_success(
    ctx: &Arc<CoreContext>,
    lease: &Lease,
    task: &Task,
    value: Value,
) -> CoreResult<ExecutionResult> {
    let done = match ctx.broker.ack(lease) {
        Ok(done) => done,
        Err(e @ BrokerError::LeaseLost { .. }) => return discard(task, &e),
        Err(e) => return Err(e.into()),
    };

    if let Some(seq) = done.wal_sequence {
        ctx.wal.commit_with_result(seq, json!({ "status": "succeeded", "result": value }))?;
    }
    if let Some(key) = &done.idempotency_key {
        // The task already succeeded; a failure to cache it must not undo that.
        if let Err(e) = ctx.idempotency.complete(key, done.id, value.clone()) {
            warn!(task_id = %done.id, key = %key, error = %e, "could not cache idempotent result");
        }
    }

    ctx.metrics.incr(names::TASKS_SUCCEEDED);
    publish(
        ctx,
        &done,
        LifecycleEventKind::Succeeded {
            attempts: done.retry_count + 1,
        },
    );
    info!(task_id = %done.id, task_name = %done.name, attempts = done.retry_count + 1, "task succeeded");
    Ok(ExecutionResult::Succeeded(value))
}

fn settle_failure(
    ctx: &Arc<CoreContext>,
    lease: &Lease,
    task: &Task,
    error: &str,
    override_delay: Option<Duration>,
) -> CoreResult<ExecutionResult> {
    if !ctx.broker.holds(lease)? {
        return discard(task, &"lease no longer held");
    }

    match ctx
        .retry
        .schedule_retry(ctx.broker.as_ref(), lease, task, error, override_delay)?
    {
        RetryDecision::Scheduled { attempt, delay, .. } => {
            Ok(ExecutionResult::RetryScheduled { attempt, delay })
        }
        RetryDecision::DeadLettered(entry) => {
            if let Some(seq) = task.wal_sequence {
                ctx.wal.commit_with_result(
                    seq,
                    json!({ "status": "dead_lettered", "error": entry.exception_summary }),
                )?;
            }
            if let Some(key) = &task.idempotency_key {
                ctx.idempotency.release(key, task.id)?;
            }
            Ok(ExecutionResult::DeadLettered)
        }
    }
}

fn settle_interrupted(ctx: &Arc<CoreContext>, lease: &Lease, task: &Task) -> CoreResult<ExecutionResult> {
    // Returning Interrupted without a raised flag just hands the task back.
    let action = if lease.cancel.is_cancelled() {
        NackAction::Cancel
    } else {
        NackAction::Requeue
    };
    let requeue = action == NackAction::Requeue;

    let done = match ctx.broker.nack(lease, action) {
        Ok(done) => done,
        Err(e @ BrokerError::LeaseLost { .. }) => return discard(task, &e),
        Err(e) => return Err(e.into()),
    };
    if requeue {
        return Ok(ExecutionResult::Requeued);
    }

    if let Some(seq) = done.wal_sequence {
        ctx.wal.commit_with_result(seq, json!({ "status": "cancelled" }))?;
    }
    if let Some(key) = &done.idempotency_key {
        ctx.idempotency.release(key, done.id)?;
    }
    ctx.metrics.incr(names::TASKS_CANCELLED);
    publish(ctx, &done, LifecycleEventKind::Cancelled);
    info!(task_id = %done.id, task_name = %done.name, "task cancelled while executing");
    Ok(ExecutionResult::Cancelled)
}

fn discard(task: &Task, reason: &dyn std::fmt::Display) -> CoreResult<ExecutionResult> {
    warn!(task_id = %task.id, task_name = %task.name, reason = %reason, "lease lost, outcome discarded");
    Ok(ExecutionResult::Discarded)
}

fn publish(ctx: &CoreContext, task: &Task, kind: LifecycleEventKind) {
    let event = LifecycleEvent::new(task.id, task.name.clone(), ctx.clock.now(), kind);
    if let Err(e) = ctx.events.publish(event) {
        warn!(task_id = %task.id, error = ?e, "failed to publish lifecycle event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::config::CoreConfig;
    use crate::context::CoreContextBuilder;
    use crate::jobs::registry::{HandlerOptions, HandlerRegistry};
    use crate::jobs::types::{RetryPolicy, TaskState};
    use crate::service::SubmitRequest;

    fn context(registry: HandlerRegistry, config: CoreConfig) -> Arc<CoreContext> {
        CoreContextBuilder::new(config)
            .registry(registry)
            .build()
            .unwrap()
    }

    fn fast_config() -> CoreConfig {
        CoreConfig::default()
            .with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO))
            .with_task_timeout(Duration::from_secs(5))
    }

    #[test]
    fn successful_task_is_acked_and_wal_committed() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("echo", |inv: &TaskInvocation| {
                TaskOutcome::Success(inv.task.payload.args.first().cloned().unwrap_or(Value::Null))
            })
            .unwrap();
        let ctx = context(registry, fast_config());
        let service = crate::service::TaskService::new(ctx.clone());
        let sub = service
            .submit(SubmitRequest::new("echo").with_args(vec![json!("hi")]))
            .unwrap();

        let report = WorkerPool::run_once(&ctx, WorkerId::new(), Duration::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(report.result, ExecutionResult::Succeeded(json!("hi")));
        assert_eq!(service.get_status(sub.task_id).unwrap(), TaskState::Succeeded);
        assert!(ctx.wal.pending().unwrap().is_empty());
    }

    #[test]
    fn failing_task_retries_then_dead_letters() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register("flaky", move |_: &TaskInvocation| {
                seen.fetch_add(1, Ordering::SeqCst);
                TaskOutcome::Failure("nope".into())
            })
            .unwrap();
        let ctx = context(registry, fast_config());
        let service = crate::service::TaskService::new(ctx.clone());
        let sub = service.submit(SubmitRequest::new("flaky")).unwrap();

        let w = WorkerId::new();
        let mut results = Vec::new();
        while let Some(report) = WorkerPool::run_once(&ctx, w, Duration::from_millis(20)).unwrap() {
            results.push(report.result);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(results.last(), Some(&ExecutionResult::DeadLettered));
        assert_eq!(service.get_status(sub.task_id).unwrap(), TaskState::DeadLettered);
        assert_eq!(ctx.dead_letters.count().unwrap(), 1);
        assert!(ctx.wal.pending().unwrap().is_empty());
    }

    #[test]
    fn slow_handler_times_out_into_the_retry_path() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_with(
                "slow",
                HandlerOptions::default().with_timeout(Duration::from_millis(30)),
                |inv: &TaskInvocation| {
                    inv.sleep_cancellable(Duration::from_secs(2));
                    TaskOutcome::Success(Value::Null)
                },
            )
            .unwrap();
        let ctx = context(registry, fast_config());
        let service = crate::service::TaskService::new(ctx.clone());
        let sub = service.submit(SubmitRequest::new("slow")).unwrap();

        let report = WorkerPool::run_once(&ctx, WorkerId::new(), Duration::ZERO)
            .unwrap()
            .unwrap();
        assert!(matches!(report.result, ExecutionResult::RetryScheduled { attempt: 1, .. }));
        let task = service.get_task(sub.task_id).unwrap();
        assert!(task.last_error.unwrap().contains("timed out"));
    }

    #[test]
    fn handler_ignoring_its_timeout_is_not_run_twice_at_once() {
        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let mut registry = HandlerRegistry::new();
        {
            let (running, overlapped) = (running.clone(), overlapped.clone());
            registry
                .register_with(
                    "stubborn",
                    HandlerOptions::default().with_timeout(Duration::from_millis(30)),
                    move |_: &TaskInvocation| {
                        if running.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlapped.store(true, Ordering::SeqCst);
                        }
                        thread::sleep(Duration::from_millis(300));
                        running.fetch_sub(1, Ordering::SeqCst);
                        TaskOutcome::Success(Value::Null)
                    },
                )
                .unwrap();
        }
        let ctx = context(
            registry,
            fast_config().with_lease_duration(Duration::from_millis(100)),
        );
        let service = crate::service::TaskService::new(ctx.clone());
        let sub = service.submit(SubmitRequest::new("stubborn")).unwrap();

        let lease = ctx.broker.dequeue(WorkerId::new(), Duration::ZERO).unwrap().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let other = {
            let (ctx, stop) = (ctx.clone(), stop.clone());
            thread::spawn(move || {
                let w = WorkerId::new();
                let mut redelivered = Vec::new();
                while !stop.load(Ordering::SeqCst) {
                    if let Some(report) = WorkerPool::run_once(&ctx, w, Duration::from_millis(10)).unwrap() {
                        redelivered.push(report.task_id);
                    }
                }
                redelivered
            })
        };

        let started = Instant::now();
        let report = execute_lease(&ctx, "w-1", &lease).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(matches!(report.result, ExecutionResult::RetryScheduled { attempt: 1, .. }));
        assert!(service.get_task(sub.task_id).unwrap().last_error.unwrap().contains("timed out"));

        stop.store(true, Ordering::SeqCst);
        other.join().unwrap();
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[test]
    fn panicking_handler_counts_as_a_failure() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("panics", |_: &TaskInvocation| -> TaskOutcome { panic!("boom") })
            .unwrap();
        let ctx = context(registry, fast_config());
        let service = crate::service::TaskService::new(ctx.clone());
        service.submit(SubmitRequest::new("panics")).unwrap();

        let report = WorkerPool::run_once(&ctx, WorkerId::new(), Duration::ZERO)
            .unwrap()
            .unwrap();
        assert!(matches!(report.result, ExecutionResult::RetryScheduled { .. }));
    }

    #[test]
    fn cancelled_while_executing_ends_cancelled() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("long", |inv: &TaskInvocation| {
                if inv.sleep_cancellable(Duration::from_secs(5)) {
                    TaskOutcome::Success(Value::Null)
                } else {
                    TaskOutcome::Interrupted
                }
            })
            .unwrap();
        let ctx = context(registry, fast_config());
        let service = Arc::new(crate::service::TaskService::new(ctx.clone()));
        let sub = service.submit(SubmitRequest::new("long")).unwrap();

        let canceller = {
            let service = service.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                service.cancel(sub.task_id).unwrap()
            })
        };
        let report = WorkerPool::run_once(&ctx, WorkerId::new(), Duration::ZERO)
            .unwrap()
            .unwrap();
        canceller.join().unwrap();

        assert_eq!(report.result, ExecutionResult::Cancelled);
        assert_eq!(service.get_status(sub.task_id).unwrap(), TaskState::Cancelled);
    }

    #[test]
    fn pool_processes_everything_and_stops() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register("count", move |_: &TaskInvocation| {
                counter.fetch_add(1, Ordering::SeqCst);
                TaskOutcome::Success(Value::Null)
            })
            .unwrap();
        let ctx = context(registry, fast_config());
        let service = crate::service::TaskService::new(ctx.clone());
        for _ in 0..20 {
            service.submit(SubmitRequest::new("count")).unwrap();
        }

        let pool = WorkerPool::spawn(
            ctx.clone(),
            WorkerPoolConfig::default()
                .with_workers(4)
                .with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while done.load(Ordering::SeqCst) < 20 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        pool.stop();
        let stats = pool.join();

        assert_eq!(done.load(Ordering::SeqCst), 20);
        assert_eq!(stats.tasks_succeeded, 20);
        assert_eq!(stats.current_running, 0);
    }
}
