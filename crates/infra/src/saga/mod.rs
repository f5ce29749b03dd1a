//! Saga orchestration: ordered steps with compensations, recorded in the WAL.

mod orchestrator;
mod types;

pub use orchestrator::{SAGA_COMPENSATE, SAGA_STARTED, SAGA_STEP, SagaOrchestrator};
pub use types::{
    Compensation, SagaDefinition, SagaOutcome, SagaRecord, SagaState, SagaStep, StepAction,
    StepContext, StepRecord, StepStatus, correlation_id,
};
