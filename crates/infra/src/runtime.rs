//! Process lifecycle: recover, run workers, shut down gracefully.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{error, info};

use jobforge_core::{CoreError, CoreResult, SagaId};

use crate::context::CoreContext;
use crate::jobs::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats};
use crate::service::TaskService;
use crate::shutdown::{ShutdownReason, ShutdownReport};
use crate::wal::ReplayReport;

/// What recovery found at start.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub replay: ReplayReport,
    pub sagas_resumed: usize,
    /// Sagas whose resumption ended in a compensation failure or error.
    pub sagas_failed: Vec<SagaId>,
}

/// A started job core.
pub struct Runtime {
    ctx: Arc<CoreContext>,
    pool: Mutex<Option<WorkerPoolHandle>>,
    recovery: RecoveryReport,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("recovery", &self.recovery)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Replay the WAL and resume interrupted sagas, then start the workers.
    ///
    /// Recovery finishes before any worker leases a task, so restored tasks
    /// compete under the normal priority rules.
    pub fn start(ctx: Arc<CoreContext>, pool_config: WorkerPoolConfig) -> CoreResult<Self> {
        let recovery = Self::recover(&ctx)?;
        let pool = WorkerPool::spawn(ctx.clone(), pool_config)?;
        info!(
            replayed = recovery.replay.deferred + recovery.replay.applied,
            sagas_resumed = recovery.sagas_resumed,
            "runtime started"
        );
        Ok(Self {
            ctx,
            pool: Mutex::new(Some(pool)),
            recovery,
        })
    }

    /// Recovery only, without workers.
    pub fn recover(ctx: &Arc<CoreContext>) -> CoreResult<RecoveryReport> {
        let replay = ctx.wal.replay()?;
        let mut report = RecoveryReport {
            replay,
            ..RecoveryReport::default()
        };
        for (saga_id, outcome) in ctx.sagas.recover_pending()? {
            report.sagas_resumed += 1;
            if let Err(e) = outcome {
                error!(saga_id = %saga_id, error = %e, "resumed saga did not finish cleanly");
                report.sagas_failed.push(saga_id);
            }
        }
        Ok(report)
    }

    pub fn context(&self) -> &Arc<CoreContext> {
        &self.ctx
    }

    pub fn service(&self) -> TaskService {
        TaskService::new(self.ctx.clone())
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn worker_stats(&self) -> Option<WorkerStats> {
        self.pool
            .lock()
            .ok()
            .and_then(|pool| pool.as_ref().map(WorkerPoolHandle::stats))
    }

    /// Drain in-flight work, stop the workers, checkpoint the WAL and close
    /// the broker.
    ///
    /// Tasks still running at the drain timeout are interrupted and handed
    /// back; their WAL entries stay pending, so the next start runs them.
    pub fn shutdown(&self, reason: ShutdownReason) -> CoreResult<ShutdownReport> {
        let drain = self.ctx.shutdown.drain(reason, self.ctx.broker.as_ref())?;

        let pool = self
            .pool
            .lock()
            .map_err(|_| CoreError::transient("runtime pool lock poisoned"))?
            .take();
        if let Some(pool) = pool {
            pool.stop();
            let stats = pool.join();
            info!(
                processed = stats.tasks_processed,
                succeeded = stats.tasks_succeeded,
                discarded = stats.outcomes_discarded,
                "workers stopped"
            );
        }

        let report = self.ctx.shutdown.finish(drain, &self.ctx.wal);
        self.ctx.teardown();
        Ok(report)
    }
}
