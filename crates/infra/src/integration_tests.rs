//! End-to-end tests across broker, workers, WAL, sagas and shutdown.
//!
//! Durations are scaled down: a 500ms drain stands in for the production
//! drain timeout.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use jobforge_core::{CoreError, ExpectedVersion, TaskId, WorkerId};

use crate::config::CoreConfig;
use crate::context::{CoreContext, CoreContextBuilder};
use crate::jobs::{
    HandlerRegistry, RetryPolicy, TaskInvocation, TaskOutcome, TaskState, WorkerPool,
    WorkerPoolConfig,
};
use crate::runtime::Runtime;
use crate::saga::{SagaDefinition, SagaOutcome, SagaState};
use crate::service::{SubmitRequest, TaskService};
use crate::shutdown::ShutdownReason;

type Effects = Arc<Mutex<Vec<String>>>;

fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("jobforge-it-{}", jobforge_core::TaskId::new()))
}

fn label(inv: &TaskInvocation) -> String {
    inv.task
        .payload
        .args
        .first()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// `record` applies its effect immediately; `short` and `long` apply it
/// after sleeping, unless interrupted first.
fn registry(effects: &Effects, long_sleep: Duration) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    let e = effects.clone();
    registry
        .register("record", move |inv: &TaskInvocation| {
            e.lock().unwrap().push(label(inv));
            TaskOutcome::Success(json!(label(inv)))
        })
        .unwrap();

    let e = effects.clone();
    registry
        .register("short", move |inv: &TaskInvocation| {
            if !inv.sleep_cancellable(Duration::from_millis(200)) {
                return TaskOutcome::Interrupted;
            }
            e.lock().unwrap().push("short".into());
            TaskOutcome::Success(Value::Null)
        })
        .unwrap();

    let e = effects.clone();
    registry
        .register("long", move |inv: &TaskInvocation| {
            if !inv.sleep_cancellable(long_sleep) {
                return TaskOutcome::Interrupted;
            }
            e.lock().unwrap().push("long".into());
            TaskOutcome::Success(Value::Null)
        })
        .unwrap();

    registry
}

fn drain_queue(ctx: &Arc<CoreContext>) {
    let worker = WorkerId::new();
    while WorkerPool::run_once(ctx, worker, Duration::from_millis(20))
        .unwrap()
        .is_some()
    {}
}

fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn higher_priority_runs_first() {
    let effects: Effects = Arc::default();
    let ctx = CoreContextBuilder::new(CoreConfig::default())
        .registry(registry(&effects, Duration::ZERO))
        .build()
        .unwrap();
    let service = TaskService::new(ctx.clone());

    for (name, priority) in [("low", 1), ("high", 9), ("mid", 5), ("high-2", 9)] {
        service
            .submit(
                SubmitRequest::new("record")
                    .with_args(vec![json!(name)])
                    .with_priority(priority),
            )
            .unwrap();
    }
    drain_queue(&ctx);

    assert_eq!(*effects.lock().unwrap(), vec!["high", "high-2", "mid", "low"]);
}

#[test]
fn duplicate_submissions_apply_the_effect_once() {
    let effects: Effects = Arc::default();
    let ctx = CoreContextBuilder::new(CoreConfig::default())
        .registry(registry(&effects, Duration::ZERO))
        .build()
        .unwrap();
    let service = TaskService::new(ctx.clone());
    let request = SubmitRequest::new("record")
        .with_args(vec![json!("charge")])
        .with_idempotency_key("order-42");

    let first = service.submit(request.clone()).unwrap();
    let second = service.submit(request.clone()).unwrap();
    drain_queue(&ctx);
    let third = service.submit(request).unwrap();

    assert_eq!(second.task_id, first.task_id);
    assert_eq!(third.task_id, first.task_id);
    assert_eq!(third.cached_result, Some(json!("charge")));
    assert_eq!(*effects.lock().unwrap(), vec!["charge"]);
}

#[test]
fn crash_with_pending_entries_recovers_each_task_once() {
    let dir = temp_dir();
    let config = CoreConfig::default().with_wal_path(dir.join("wal.jsonl"));
    let effects: Effects = Arc::default();

    let submitted: Vec<TaskId> = {
        let ctx = CoreContextBuilder::new(config.clone())
            .registry(registry(&effects, Duration::ZERO))
            .build()
            .unwrap();
        let service = TaskService::new(ctx.clone());
        let ids = ["a", "b", "c"]
            .into_iter()
            .map(|n| {
                service
                    .submit(SubmitRequest::new("record").with_args(vec![json!(n)]))
                    .unwrap()
                    .task_id
            })
            .collect();
        // One task finishes, then the process dies without shutting down.
        WorkerPool::run_once(&ctx, WorkerId::new(), Duration::ZERO)
            .unwrap()
            .unwrap();
        ids
    };

    let ctx = CoreContextBuilder::new(config)
        .registry(registry(&effects, Duration::ZERO))
        .build()
        .unwrap();
    let recovery = Runtime::recover(&ctx).unwrap();
    assert_eq!(recovery.replay.deferred, 2);
    drain_queue(&ctx);

    let mut applied = effects.lock().unwrap().clone();
    applied.sort();
    assert_eq!(applied, vec!["a", "b", "c"]);
    assert!(ctx.wal.pending().unwrap().is_empty());

    let service = TaskService::new(ctx.clone());
    for id in &submitted[1..] {
        assert_eq!(service.get_status(*id).unwrap(), TaskState::Succeeded);
    }

    // A second replay in the same process restores nothing.
    assert_eq!(Runtime::recover(&ctx).unwrap().replay.deferred, 0);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn failed_saga_step_restores_the_pre_saga_state() {
    let ctx = CoreContextBuilder::new(CoreConfig::default()).build().unwrap();
    ctx.locks.create("stock:widget", json!(10), "setup").unwrap();
    ctx.locks.create("orders", json!([]), "setup").unwrap();
    let before = (
        ctx.locks.read("stock:widget").unwrap().value,
        ctx.locks.read("orders").unwrap().value,
    );

    let reserve_locks = ctx.locks.clone();
    let release_locks = ctx.locks.clone();
    let order_locks = ctx.locks.clone();
    let cancel_locks = ctx.locks.clone();
    let definition = SagaDefinition::new("place_order")
        .compensated_step(
            "reserve",
            move |step| {
                let qty = step.get("qty").and_then(Value::as_i64).unwrap_or(0);
                let stock = reserve_locks.read("stock:widget").map_err(|e| e.to_string())?;
                let left = stock.value.as_i64().unwrap_or(0) - qty;
                reserve_locks
                    .write("stock:widget", json!(left), ExpectedVersion::Exact(stock.version), "saga")
                    .map_err(|e| e.to_string())?;
                Ok(json!({ "reserved": qty }))
            },
            move |_, result| {
                let stock = release_locks.read("stock:widget").map_err(|e| e.to_string())?;
                let restored = stock.value.as_i64().unwrap_or(0) + result["reserved"].as_i64().unwrap_or(0);
                release_locks
                    .write("stock:widget", json!(restored), ExpectedVersion::Exact(stock.version), "saga")
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            },
        )
        .compensated_step(
            "charge",
            |_| Err("card declined".to_string()),
            |_, _| Err("charge was never made".to_string()),
        )
        .compensated_step(
            "record",
            move |_| {
                let orders = order_locks.read("orders").map_err(|e| e.to_string())?;
                let mut list = orders.value.as_array().cloned().unwrap_or_default();
                list.push(json!("order"));
                order_locks
                    .write("orders", Value::Array(list), ExpectedVersion::Exact(orders.version), "saga")
                    .map_err(|e| e.to_string())?;
                Ok(Value::Null)
            },
            move |_, _| {
                let orders = cancel_locks.read("orders").map_err(|e| e.to_string())?;
                let mut list = orders.value.as_array().cloned().unwrap_or_default();
                list.pop();
                cancel_locks
                    .write("orders", Value::Array(list), ExpectedVersion::Exact(orders.version), "saga")
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            },
        );

    let outcome = ctx.sagas.execute(&definition, json!({ "qty": 3 })).unwrap();
    let SagaOutcome::Compensated(record) = outcome else {
        panic!("expected the saga to compensate");
    };
    assert_eq!(record.error.as_deref(), Some("card declined"));

    let after = (
        ctx.locks.read("stock:widget").unwrap().value,
        ctx.locks.read("orders").unwrap().value,
    );
    assert_eq!(after, before);
    assert_eq!(ctx.sagas.status(record.saga_id).unwrap().state, SagaState::Compensated);
    assert!(ctx.wal.pending().unwrap().is_empty());
}

#[test]
fn handler_can_drive_a_saga_and_report_compensation_failure() {
    let mut registry = HandlerRegistry::new();
    registry
        .register("provision", |inv: &TaskInvocation| {
            let definition = SagaDefinition::new("provision")
                .compensated_step("allocate", |_| Ok(json!("vm-1")), |_, _| Err("vm stuck".into()))
                .step("configure", |_| Err("config rejected".into()));
            match inv.context().sagas.execute(&definition, json!({})) {
                Ok(outcome) => TaskOutcome::Success(json!(outcome.record().state.as_str())),
                Err(CoreError::CompensationFailure { failures, .. }) => {
                    TaskOutcome::Failure(format!("{} compensation(s) failed", failures.len()))
                }
                Err(e) => TaskOutcome::Failure(e.to_string()),
            }
        })
        .unwrap();
    let ctx = CoreContextBuilder::new(
        CoreConfig::default().with_retry_policy(RetryPolicy::no_retry()),
    )
    .registry(registry)
    .build()
    .unwrap();
    let service = TaskService::new(ctx.clone());
    let sub = service.submit(SubmitRequest::new("provision")).unwrap();
    drain_queue(&ctx);

    assert_eq!(service.get_status(sub.task_id).unwrap(), TaskState::DeadLettered);
    let entry = ctx.dead_letters.get(sub.task_id).unwrap().unwrap();
    assert_eq!(entry.exception_summary, "1 compensation(s) failed");
}

#[test]
fn shutdown_drains_short_tasks_and_redelivers_long_ones() {
    let dir = temp_dir();
    let config = CoreConfig::default()
        .with_wal_path(dir.join("wal.jsonl"))
        .with_drain_timeout(Duration::from_millis(500))
        .with_poll_interval(Duration::from_millis(10));
    let pool = WorkerPoolConfig::default()
        .with_workers(2)
        .with_poll_interval(Duration::from_millis(10));
    let effects: Effects = Arc::default();

    let (short_id, long_id) = {
        let ctx = CoreContextBuilder::new(config.clone())
            .registry(registry(&effects, Duration::from_secs(1)))
            .build()
            .unwrap();
        let runtime = Runtime::start(ctx, pool.clone()).unwrap();
        let service = runtime.service();
        let long_id = service.submit(SubmitRequest::new("long")).unwrap().task_id;
        let short_id = service.submit(SubmitRequest::new("short")).unwrap().task_id;

        assert!(wait_until(Duration::from_secs(2), || {
            [short_id, long_id]
                .iter()
                .all(|id| service.get_status(*id).ok() == Some(TaskState::Executing))
        }));

        let report = runtime.shutdown(ShutdownReason::Sigterm).unwrap();
        assert_eq!(report.drained, 1);
        assert_eq!(report.interrupted, vec![long_id]);
        assert_eq!(service.get_status(short_id).unwrap(), TaskState::Succeeded);
        (short_id, long_id)
    };
    assert_eq!(*effects.lock().unwrap(), vec!["short"]);

    let ctx = CoreContextBuilder::new(config)
        .registry(registry(&effects, Duration::from_millis(50)))
        .build()
        .unwrap();
    let runtime = Runtime::start(ctx, pool).unwrap();
    assert_eq!(runtime.recovery().replay.deferred, 1);
    let service = runtime.service();
    assert_eq!(
        service.wait_for(long_id, Duration::from_secs(3)).unwrap(),
        TaskState::Succeeded
    );
    // Only the committed WAL entry remembers the short task now.
    assert_eq!(service.get_status(short_id).unwrap(), TaskState::Succeeded);
    runtime.shutdown(ShutdownReason::Manual).unwrap();

    assert_eq!(*effects.lock().unwrap(), vec!["short", "long"]);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn concurrent_writers_through_handlers_see_one_winner() {
    let ctx = CoreContextBuilder::new(CoreConfig::default()).build().unwrap();
    ctx.locks.create("counter", json!(0), "setup").unwrap();
    let seen = ctx.locks.read("counter").unwrap();
    let conflicts = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let ctx = ctx.clone();
            let conflicts = conflicts.clone();
            let seen = seen.clone();
            thread::spawn(move || {
                match ctx.locks.write(
                    "counter",
                    json!(i + 1),
                    ExpectedVersion::Exact(seen.version),
                    &format!("writer-{i}"),
                ) {
                    Ok(_) => {}
                    Err(CoreError::VersionConflict { .. }) => {
                        conflicts.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(conflicts.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.locks.read("counter").unwrap().version, 2);
}
