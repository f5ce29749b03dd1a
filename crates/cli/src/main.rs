//! `jobforge`: run the job core, or inspect its durable state.
//!
//! ```text
//! jobforge run
//! jobforge submit <name> [json-args] [--priority N] [--key K]
//! jobforge wal pending | wal checkpoint
//! jobforge dead-letters [page]
//! jobforge retry-dead-letter <task-id>
//! ```
//!
//! Configuration comes from `JOBFORGE_*` environment variables. Offline
//! commands need `JOBFORGE_WAL_PATH` so their effect survives the process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use tokio::{select, signal};
use tracing::{info, warn};

use jobforge_core::TaskId;
use jobforge_infra::jobs::{HandlerOptions, HandlerRegistry, TaskOutcome, WorkerPoolConfig};
use jobforge_infra::shutdown::ShutdownReason;
use jobforge_infra::{CoreConfig, CoreContext, CoreContextBuilder, Runtime, SubmitRequest, TaskService};

const USAGE: &str = "usage: jobforge <run | submit <name> [json-args] [--priority N] [--key K] | wal pending | wal checkpoint | dead-letters [page] | retry-dead-letter <task-id>>";

#[tokio::main]
async fn main() -> Result<()> {
    jobforge_observability::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = CoreConfig::from_env()?;

    match args.first().map(String::as_str) {
        Some("run") => run(config).await,
        Some("submit") => submit(config, &args[1..]),
        Some("wal") => match args.get(1).map(String::as_str) {
            Some("pending") => wal_pending(config),
            Some("checkpoint") => wal_checkpoint(config),
            _ => bail!(USAGE),
        },
        Some("dead-letters") => {
            let page = match args.get(1) {
                Some(raw) => raw.parse().context("page must be a number")?,
                None => 1,
            };
            dead_letters(config, page)
        }
        Some("retry-dead-letter") => {
            let raw = args.get(1).ok_or_else(|| anyhow!(USAGE))?;
            let task_id: TaskId = raw.parse()?;
            retry_dead_letter(config, task_id)
        }
        _ => bail!(USAGE),
    }
}

/// Handlers available to every command, so offline submissions validate
/// against the same names the worker run executes.
fn demo_registry() -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register("demo.echo", |inv| {
        TaskOutcome::Success(json!({
            "args": inv.task.payload.args,
            "kwargs": inv.task.payload.kwargs,
        }))
    })?;
    registry.register_with(
        "demo.sleep",
        HandlerOptions::default().with_timeout(Duration::from_secs(120)),
        |inv| {
            let ms = inv.task.payload.args.first().and_then(Value::as_u64).unwrap_or(1000);
            if inv.sleep_cancellable(Duration::from_millis(ms)) {
                TaskOutcome::Success(json!({ "slept_ms": ms }))
            } else {
                TaskOutcome::Interrupted
            }
        },
    )?;
    registry.register("demo.fail", |inv| {
        TaskOutcome::Failure(format!("demo failure on attempt {}", inv.attempt))
    })?;
    Ok(registry)
}

fn context(config: CoreConfig) -> Result<Arc<CoreContext>> {
    Ok(CoreContextBuilder::new(config)
        .registry(demo_registry()?)
        .build()?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(config: CoreConfig) -> Result<()> {
    let pool_config = WorkerPoolConfig::default()
        .with_workers(config.workers)
        .with_poll_interval(config.poll_interval);
    let ctx = context(config)?;
    let runtime = Arc::new(Runtime::start(ctx.clone(), pool_config)?);
    print_json(runtime.recovery())?;
    info!("workers started - waiting for shutdown signal");

    let reason = wait_for_shutdown().await?;
    info!(reason = %reason, "shutdown signal received - draining");

    let stopping = runtime.clone();
    let report = tokio::task::spawn_blocking(move || stopping.shutdown(reason)).await??;
    if !report.interrupted.is_empty() {
        warn!(
            interrupted = report.interrupted.len(),
            "tasks interrupted at drain timeout will run on next start"
        );
    }
    print_json(&report)?;
    print_json(&ctx.metrics.snapshot())?;
    Ok(())
}

async fn wait_for_shutdown() -> Result<ShutdownReason> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let mut terminate = unix_signal(SignalKind::terminate())?;
        select! {
            _ = signal::ctrl_c() => Ok(ShutdownReason::Sigint),
            _ = terminate.recv() => Ok(ShutdownReason::Sigterm),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        Ok(ShutdownReason::Sigint)
    }
}

/// Log a submission durably; the next `run` replays and executes it.
fn submit(config: CoreConfig, args: &[String]) -> Result<()> {
    if config.wal_path.is_none() {
        bail!("JOBFORGE_WAL_PATH must be set for offline submission");
    }
    let mut rest = args.iter();
    let name = rest.next().ok_or_else(|| anyhow!(USAGE))?;
    let mut request = SubmitRequest::new(name.as_str());

    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--priority" => {
                let raw = rest.next().ok_or_else(|| anyhow!("--priority needs a value"))?;
                request = request.with_priority(raw.parse().context("priority must be an integer")?);
            }
            "--key" => {
                let key = rest.next().ok_or_else(|| anyhow!("--key needs a value"))?;
                request = request.with_idempotency_key(key.as_str());
            }
            raw => {
                let parsed: Value = serde_json::from_str(raw).context("args must be JSON")?;
                let args = match parsed {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                request = request.with_args(args);
            }
        }
    }

    let ctx = context(config)?;
    let submission = TaskService::new(ctx).submit(request)?;
    print_json(&json!({ "task_id": submission.task_id, "duplicate": submission.duplicate }))
}

fn wal_pending(config: CoreConfig) -> Result<()> {
    let ctx = context(config)?;
    print_json(&ctx.wal.pending()?)
}

fn wal_checkpoint(config: CoreConfig) -> Result<()> {
    let ctx = context(config)?;
    print_json(&ctx.wal.checkpoint()?)
}

fn dead_letters(config: CoreConfig, page: usize) -> Result<()> {
    if config.dead_letter_path.is_none() {
        bail!("JOBFORGE_DEAD_LETTER_PATH must be set to inspect dead letters");
    }
    let ctx = context(config)?;
    print_json(&TaskService::new(ctx).list_dead_letters(page)?)
}

fn retry_dead_letter(config: CoreConfig, task_id: TaskId) -> Result<()> {
    if config.wal_path.is_none() || config.dead_letter_path.is_none() {
        bail!("JOBFORGE_WAL_PATH and JOBFORGE_DEAD_LETTER_PATH must be set to retry a dead letter");
    }
    let ctx = context(config)?;
    let new_id = TaskService::new(ctx).retry_dead_letter(task_id)?;
    print_json(&json!({ "retried": task_id, "task_id": new_id }))
}
