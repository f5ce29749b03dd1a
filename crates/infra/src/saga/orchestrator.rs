use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde_json::{Value, json};
use tracing::{error, info, warn};

use jobforge_core::error::FailedCompensation;
use jobforge_core::{CoreError, CoreResult, ErrorKind, SagaId, SharedClock};
use jobforge_observability::{Metrics, names};

use super::types::{
    SagaDefinition, SagaOutcome, SagaRecord, SagaState, StepContext, StepRecord, StepStatus,
    correlation_id,
};
use crate::wal::{ReplayDisposition, WalEntry, WalRecord, WriteAheadLog};

pub const SAGA_STARTED: &str = "saga.started";
pub const SAGA_STEP: &str = "saga.step";
pub const SAGA_COMPENSATE: &str = "saga.compensate";

/// Where an interrupted saga stands, rebuilt from its WAL entries.
#[derive(Debug, Default)]
struct Progress {
    started_seq: u64,
    /// Results of the completed prefix of steps.
    results: Vec<Value>,
    /// Step appended but never committed (crash mid-action).
    pending_step: Option<u64>,
    failure: Option<(usize, String)>,
    /// Compensations that already ran to an outcome, failed ones included.
    settled: HashSet<usize>,
    pending_compensations: HashMap<usize, u64>,
    compensation_failures: Vec<FailedCompensation>,
}

/// Runs sagas and records every step boundary in the WAL.
///
/// `saga.started` stays pending until the saga reaches a terminal state;
/// each `saga.step` and `saga.compensate` entry is appended before its
/// closure runs and committed with the outcome afterwards. That history is
/// enough for [`resume`](Self::resume) to pick up after a crash.
pub struct SagaOrchestrator {
    wal: Arc<WriteAheadLog>,
    records: RwLock<HashMap<SagaId, SagaRecord>>,
    definitions: RwLock<HashMap<String, Arc<SagaDefinition>>>,
    clock: SharedClock,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for SagaOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaOrchestrator").finish_non_exhaustive()
    }
}

fn poisoned() -> CoreError {
    CoreError::transient("saga registry poisoned")
}

fn step_index(entry: &WalEntry) -> Option<usize> {
    entry
        .intended_effects
        .get("index")
        .and_then(Value::as_u64)
        .map(|i| i as usize)
}

fn result_error(entry: &WalEntry) -> Option<String> {
    entry
        .result
        .as_ref()
        .and_then(|r| r.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

impl SagaOrchestrator {
    pub fn new(wal: Arc<WriteAheadLog>, clock: SharedClock, metrics: Arc<Metrics>) -> Self {
        Self {
            wal,
            records: RwLock::new(HashMap::new()),
            definitions: RwLock::new(HashMap::new()),
            clock,
            metrics,
        }
    }

    /// Make a definition resumable by name after a restart.
    pub fn register(&self, definition: SagaDefinition) -> CoreResult<()> {
        self.definitions
            .write()
            .map_err(|_| poisoned())?
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn definition(&self, name: &str) -> CoreResult<Option<Arc<SagaDefinition>>> {
        Ok(self
            .definitions
            .read()
            .map_err(|_| poisoned())?
            .get(name)
            .cloned())
    }

    /// Saga entries are restored by [`recover_pending`](Self::recover_pending),
    /// not by plain replay; these handlers only account for them.
    pub fn register_replay_handlers(&self) -> CoreResult<()> {
        for kind in [SAGA_STARTED, SAGA_STEP, SAGA_COMPENSATE] {
            self.wal
                .register_replay_handler(kind, |_| Ok(ReplayDisposition::Defer))?;
        }
        Ok(())
    }

    /// Run a registered definition.
    pub fn execute_named(&self, name: &str, input: Value) -> CoreResult<SagaOutcome> {
        let definition = self
            .definition(name)?
            .ok_or_else(|| CoreError::not_found(format!("saga definition '{name}'")))?;
        self.execute(&definition, input)
    }

    /// Run `definition` from the first step.
    ///
    /// A failed step unwinds the completed steps in reverse order. Returns
    /// `Err(CompensationFailure)` when any compensation fails; the saga is
    /// then left in `CompensationFailed` for an operator.
    pub fn execute(&self, definition: &SagaDefinition, input: Value) -> CoreResult<SagaOutcome> {
        let saga_id = SagaId::new();
        let now = self.clock.now();
        let mut record = SagaRecord {
            saga_id,
            name: definition.name.clone(),
            state: SagaState::Pending,
            input: input.clone(),
            steps: definition
                .steps
                .iter()
                .map(|s| StepRecord::pending(s.name.clone()))
                .collect(),
            error: None,
            compensation_failures: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let started_seq = self.wal.append(
            WalRecord::new(
                SAGA_STARTED,
                json!({ "saga_id": saga_id, "name": definition.name, "input": input }),
            )
            .with_correlation(correlation_id(saga_id)),
        )?;
        info!(saga_id = %saga_id, saga = %definition.name, steps = definition.len(), "saga started");

        record.state = SagaState::Running;
        self.drive(
            definition,
            record,
            Progress {
                started_seq,
                ..Progress::default()
            },
        )
    }

    /// Continue a saga interrupted by a crash, using its WAL history.
    ///
    /// Completed steps are not re-run. A step whose action had started but
    /// not committed runs again, so actions must tolerate repetition. A saga
    /// that already finished returns its final outcome.
    pub fn resume(&self, definition: &SagaDefinition, saga_id: SagaId) -> CoreResult<SagaOutcome> {
        let (mut record, progress) = self.rebuild(saga_id, Some(definition))?;
        if record.name != definition.name {
            return Err(CoreError::validation(format!(
                "saga {saga_id} is a '{}', not a '{}'",
                record.name, definition.name
            )));
        }
        if record.state.is_terminal() {
            return Self::finished(record);
        }

        info!(
            saga_id = %saga_id,
            saga = %definition.name,
            completed_steps = progress.results.len(),
            compensating = progress.failure.is_some(),
            "resuming saga"
        );
        record.state = if progress.failure.is_some() {
            SagaState::Compensating
        } else {
            SagaState::Running
        };
        self.drive(definition, record, progress)
    }

    /// Resume every unfinished saga whose definition is registered.
    pub fn recover_pending(&self) -> CoreResult<Vec<(SagaId, CoreResult<SagaOutcome>)>> {
        let mut recovered = Vec::new();
        for entry in self.wal.pending()? {
            if entry.kind != SAGA_STARTED {
                continue;
            }
            let Some(saga_id) = entry
                .intended_effects
                .get("saga_id")
                .and_then(|v| serde_json::from_value::<SagaId>(v.clone()).ok())
            else {
                warn!(sequence_number = entry.sequence_number, "saga entry without a saga id");
                continue;
            };
            let name = entry
                .intended_effects
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let Some(definition) = self.definition(name)? else {
                warn!(saga_id = %saga_id, saga = name, "no definition registered, saga left pending");
                continue;
            };
            recovered.push((saga_id, self.resume(&definition, saga_id)));
        }
        Ok(recovered)
    }

    /// The saga record, from memory or rebuilt from the WAL.
    pub fn status(&self, saga_id: SagaId) -> CoreResult<SagaRecord> {
        if let Some(record) = self
            .records
            .read()
            .map_err(|_| poisoned())?
            .get(&saga_id)
        {
            return Ok(record.clone());
        }
        let (record, _) = self.rebuild(saga_id, None)?;
        Ok(record)
    }

    fn store(&self, record: &SagaRecord) -> CoreResult<()> {
        self.records
            .write()
            .map_err(|_| poisoned())?
            .insert(record.saga_id, record.clone());
        Ok(())
    }

    fn finished(record: SagaRecord) -> CoreResult<SagaOutcome> {
        match record.state {
            SagaState::Completed => Ok(SagaOutcome::Completed(record)),
            SagaState::Compensated => Ok(SagaOutcome::Compensated(record)),
            _ => Err(CoreError::CompensationFailure {
                saga_id: record.saga_id,
                cause: record.error.unwrap_or_default(),
                failures: record.compensation_failures,
            }),
        }
    }

    fn step_entry(saga_id: SagaId, kind: &str, index: usize, step: &str) -> WalRecord {
        WalRecord::new(
            kind,
            json!({ "saga_id": saga_id, "step": step, "index": index }),
        )
        .with_correlation(correlation_id(saga_id))
    }

    fn drive(
        &self,
        definition: &SagaDefinition,
        mut record: SagaRecord,
        mut progress: Progress,
    ) -> CoreResult<SagaOutcome> {
        let saga_id = record.saga_id;
        self.store(&record)?;

        if progress.failure.is_none() {
            for index in progress.results.len()..definition.len() {
                let step = &definition.steps[index];
                let seq = match progress.pending_step.take() {
                    Some(seq) => seq,
                    None => self
                        .wal
                        .append(Self::step_entry(saga_id, SAGA_STEP, index, &step.name))?,
                };

                record.steps[index].status = StepStatus::Running;
                record.steps[index].started_at = Some(self.clock.now());
                self.store(&record)?;

                let prior: Vec<(String, Value)> = definition.steps[..index]
                    .iter()
                    .map(|s| s.name.clone())
                    .zip(progress.results.iter().cloned())
                    .collect();
                let ctx = StepContext::new(saga_id, &step.name, index, &record.input, &prior);

                let started = Instant::now();
                let outcome = (step.action)(&ctx);
                self.metrics.observe(names::STAGE_SAGA_STEP, started.elapsed());

                let now = self.clock.now();
                record.updated_at = now;
                record.steps[index].completed_at = Some(now);
                match outcome {
                    Ok(value) => {
                        self.wal
                            .commit_with_result(seq, json!({ "result": value }))?;
                        record.steps[index].status = StepStatus::Completed;
                        record.steps[index].result = Some(value.clone());
                        progress.results.push(value);
                        self.store(&record)?;
                    }
                    Err(e) => {
                        warn!(saga_id = %saga_id, step = %step.name, error = %e, "saga step failed");
                        self.wal.commit_with_result(seq, json!({ "error": e }))?;
                        record.steps[index].status = StepStatus::Failed;
                        record.steps[index].error = Some(e.clone());
                        progress.failure = Some((index, e));
                        break;
                    }
                }
            }
        }

        let Some((failed_index, cause)) = progress.failure.take() else {
            record.state = SagaState::Completed;
            record.updated_at = self.clock.now();
            self.wal
                .commit_with_result(progress.started_seq, json!({ "state": record.state.as_str() }))?;
            self.store(&record)?;
            self.metrics.incr_labeled(names::SAGAS, record.state.as_str());
            info!(saga_id = %saga_id, saga = %record.name, "saga completed");
            return Ok(SagaOutcome::Completed(record));
        };

        record.state = SagaState::Compensating;
        record.error = Some(cause.clone());
        self.store(&record)?;

        let mut failures = std::mem::take(&mut progress.compensation_failures);
        for index in (0..failed_index).rev() {
            if progress.settled.contains(&index) {
                continue;
            }
            let step = &definition.steps[index];
            let Some(compensation) = &step.compensation else {
                continue;
            };
            let Some(result) = progress.results.get(index) else {
                continue;
            };
            let seq = match progress.pending_compensations.remove(&index) {
                Some(seq) => seq,
                None => self
                    .wal
                    .append(Self::step_entry(saga_id, SAGA_COMPENSATE, index, &step.name))?,
            };

            let prior: Vec<(String, Value)> = definition.steps[..index]
                .iter()
                .map(|s| s.name.clone())
                .zip(progress.results.iter().cloned())
                .collect();
            let ctx = StepContext::new(saga_id, &step.name, index, &record.input, &prior);
            match compensation(&ctx, result) {
                Ok(()) => {
                    self.wal
                        .commit_with_result(seq, json!({ "compensated": true }))?;
                    record.steps[index].status = StepStatus::Compensated;
                }
                Err(e) => {
                    error!(saga_id = %saga_id, step = %step.name, error = %e, "compensation failed");
                    self.wal.commit_with_result(seq, json!({ "error": e }))?;
                    record.steps[index].status = StepStatus::CompensationFailed;
                    record.steps[index].compensation_error = Some(e.clone());
                    failures.push(FailedCompensation {
                        step: step.name.clone(),
                        error: e,
                    });
                }
            }
            record.updated_at = self.clock.now();
            self.store(&record)?;
        }

        record.state = if failures.is_empty() {
            SagaState::Compensated
        } else {
            SagaState::CompensationFailed
        };
        record.compensation_failures = failures.clone();
        record.updated_at = self.clock.now();
        self.wal.commit_with_result(
            progress.started_seq,
            json!({
                "state": record.state.as_str(),
                "error": cause,
                "failures": failures,
            }),
        )?;
        self.store(&record)?;
        self.metrics.incr_labeled(names::SAGAS, record.state.as_str());

        if failures.is_empty() {
            info!(saga_id = %saga_id, saga = %record.name, cause = %cause, "saga compensated");
            Ok(SagaOutcome::Compensated(record))
        } else {
            self.metrics
                .incr_labeled(names::ERRORS, ErrorKind::CompensationFailure.as_str());
            error!(
                saga_id = %saga_id,
                saga = %record.name,
                failed = failures.len(),
                "saga needs manual intervention"
            );
            Err(CoreError::CompensationFailure {
                saga_id,
                cause,
                failures,
            })
        }
    }

    /// Rebuild a saga record and its progress from the WAL.
    fn rebuild(
        &self,
        saga_id: SagaId,
        definition: Option<&SagaDefinition>,
    ) -> CoreResult<(SagaRecord, Progress)> {
        let entries = self.wal.entries_for(&correlation_id(saga_id))?;
        let started = entries
            .iter()
            .find(|e| e.kind == SAGA_STARTED)
            .ok_or_else(|| CoreError::not_found(format!("saga {saga_id}")))?;

        let name = started
            .intended_effects
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut record = SagaRecord {
            saga_id,
            name,
            state: SagaState::Running,
            input: started
                .intended_effects
                .get("input")
                .cloned()
                .unwrap_or(Value::Null),
            steps: definition
                .map(|d| {
                    d.steps
                        .iter()
                        .map(|s| StepRecord::pending(s.name.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            error: None,
            compensation_failures: Vec::new(),
            created_at: started.appended_at,
            updated_at: started.committed_at.unwrap_or(started.appended_at),
        };
        let mut progress = Progress {
            started_seq: started.sequence_number,
            ..Progress::default()
        };

        for entry in &entries {
            let Some(index) = step_index(entry) else {
                continue;
            };
            while record.steps.len() <= index {
                record.steps.push(StepRecord::pending(String::new()));
            }
            let step = &mut record.steps[index];
            if step.name.is_empty() {
                if let Some(name) = entry.intended_effects.get("step").and_then(Value::as_str) {
                    step.name = name.to_string();
                }
            }

            match entry.kind.as_str() {
                SAGA_STEP => {
                    step.started_at = Some(entry.appended_at);
                    step.completed_at = entry.committed_at;
                    if entry.is_pending() {
                        step.status = StepStatus::Running;
                        progress.pending_step = Some(entry.sequence_number);
                    } else if let Some(e) = result_error(entry) {
                        step.status = StepStatus::Failed;
                        step.error = Some(e.clone());
                        record.error = Some(e.clone());
                        progress.failure = Some((index, e));
                    } else {
                        let value = entry
                            .result
                            .as_ref()
                            .and_then(|r| r.get("result"))
                            .cloned()
                            .unwrap_or(Value::Null);
                        step.status = StepStatus::Completed;
                        step.result = Some(value.clone());
                        progress.results.push(value);
                    }
                }
                SAGA_COMPENSATE => {
                    if entry.is_pending() {
                        progress
                            .pending_compensations
                            .insert(index, entry.sequence_number);
                    } else if let Some(e) = result_error(entry) {
                        // Never retried: an operator decides what happens next.
                        step.status = StepStatus::CompensationFailed;
                        step.compensation_error = Some(e.clone());
                        progress.settled.insert(index);
                        progress.compensation_failures.push(FailedCompensation {
                            step: step.name.clone(),
                            error: e,
                        });
                    } else {
                        step.status = StepStatus::Compensated;
                        progress.settled.insert(index);
                    }
                }
                _ => {}
            }
        }

        if progress.failure.is_some() {
            record.state = SagaState::Compensating;
        }
        if !started.is_pending() {
            let final_state = started
                .result
                .as_ref()
                .and_then(|r| r.get("state"))
                .and_then(Value::as_str)
                .and_then(SagaState::parse)
                .unwrap_or(SagaState::Completed);
            record.state = final_state;
            record.compensation_failures = progress.compensation_failures.clone();
        }
        Ok((record, progress))
    }
}
