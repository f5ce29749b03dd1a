use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use jobforge_core::SagaId;
use jobforge_core::error::FailedCompensation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    Pending,
    Running,
    Compensating,
    Completed,
    Compensated,
    /// Terminal; needs an operator.
    CompensationFailed,
}

impl SagaState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Compensated | SagaState::CompensationFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SagaState::Pending => "pending",
            SagaState::Running => "running",
            SagaState::Compensating => "compensating",
            SagaState::Completed => "completed",
            SagaState::Compensated => "compensated",
            SagaState::CompensationFailed => "compensation_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => SagaState::Pending,
            "running" => SagaState::Running,
            "compensating" => SagaState::Compensating,
            "completed" => SagaState::Completed,
            "compensated" => SagaState::Compensated,
            "compensation_failed" => SagaState::CompensationFailed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensated,
    CompensationFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub compensation_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            compensation_error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Everything known about one saga execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub saga_id: SagaId,
    pub name: String,
    pub state: SagaState,
    pub input: Value,
    pub steps: Vec<StepRecord>,
    /// Why the forward path stopped.
    pub error: Option<String>,
    pub compensation_failures: Vec<FailedCompensation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    pub fn correlation_id(&self) -> String {
        correlation_id(self.saga_id)
    }
}

/// WAL correlation id of a saga's entries.
pub fn correlation_id(saga_id: SagaId) -> String {
    format!("saga:{saga_id}")
}

/// What a step action sees: the saga input merged with the results of the
/// steps before it, keyed by step name.
#[derive(Debug, Clone, PartialEq)]
pub struct StepContext {
    pub saga_id: SagaId,
    pub step: String,
    pub index: usize,
    data: Map<String, Value>,
}

impl StepContext {
    pub(crate) fn new(
        saga_id: SagaId,
        step: &str,
        index: usize,
        input: &Value,
        prior: &[(String, Value)],
    ) -> Self {
        let mut data = match input {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other.clone());
                map
            }
        };
        for (name, result) in prior {
            data.insert(name.clone(), result.clone());
        }
        Self {
            saga_id,
            step: step.to_string(),
            index,
            data,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }
}

pub type StepAction = Arc<dyn Fn(&StepContext) -> Result<Value, String> + Send + Sync>;

/// Undo for a completed step; receives that step's result.
pub type Compensation = Arc<dyn Fn(&StepContext, &Value) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub struct SagaStep {
    pub name: String,
    pub action: StepAction,
    pub compensation: Option<Compensation>,
}

impl std::fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("compensated", &self.compensation.is_some())
            .finish()
    }
}

/// An ordered list of steps.
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    pub name: String,
    pub steps: Vec<SagaStep>,
}

impl SagaDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// A step with nothing to undo.
    pub fn step<A>(mut self, name: impl Into<String>, action: A) -> Self
    where
        A: Fn(&StepContext) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            action: Arc::new(action),
            compensation: None,
        });
        self
    }

    pub fn compensated_step<A, C>(mut self, name: impl Into<String>, action: A, compensation: C) -> Self
    where
        A: Fn(&StepContext) -> Result<Value, String> + Send + Sync + 'static,
        C: Fn(&StepContext, &Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            action: Arc::new(action),
            compensation: Some(Arc::new(compensation)),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// How a saga ended without needing an operator.
#[derive(Debug, Clone, PartialEq)]
pub enum SagaOutcome {
    Completed(SagaRecord),
    /// A step failed and every completed step was undone.
    Compensated(SagaRecord),
}

impl SagaOutcome {
    pub fn record(&self) -> &SagaRecord {
        match self {
            SagaOutcome::Completed(r) | SagaOutcome::Compensated(r) => r,
        }
    }

    pub fn into_record(self) -> SagaRecord {
        match self {
            SagaOutcome::Completed(r) | SagaOutcome::Compensated(r) => r,
        }
    }
}
