//! Wire shapes for the Boundary Layer. `WorkflowDefinition`
//! and `StepSpec` round-trip through `workflow_core`'s own types unchanged
//! — their field names already match the normative shape — everything
//! else here is a request/response/event envelope that doesn't exist
//! internally.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use workflow_core::{ContextValue, EngineError, EngineErrorCode, ErrorInfo, StepStatus};
use workflow_runtime::EngineEventKind;

pub use workflow_core::{StepSpec, WorkflowDefinition, WorkflowDefinitionInput, WorkflowSummary};

/// `initial_context:{data:{}}` / `input:{data:{}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextPayload {
  #[serde(default)]
  pub data: IndexMap<String, ContextValue>,
}

/// Per-request overrides of `EngineOptions` (
/// `StartExecutionRequest.options`). `step_deadlines` maps a step kind's
/// wire name (e.g. `"AUTOMATED"`) to a deadline in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOptions {
  pub max_parallelism: Option<usize>,
  pub step_deadlines: Option<HashMap<String, u64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartExecutionRequest {
  pub workflow_id: String,
  pub version: Option<i64>,
  pub principal_id: String,
  pub session_id: String,
  #[serde(default)]
  pub initial_context: ContextPayload,
  #[serde(default)]
  pub options: Option<ExecutionOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartExecutionResponse {
  pub execution_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatusEntry {
  pub step_id: String,
  pub status: StepStatus,
}

/// `ExecutionStatus`: the point-in-time view `GetExecution`
/// returns. `version` is the context's latest committed version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatusView {
  pub execution_id: Uuid,
  pub workflow_id: String,
  pub workflow_version: i64,
  pub status: workflow_core::ExecutionStatus,
  pub current_steps: Vec<StepStatusEntry>,
  pub version: i64,
  pub started_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  pub error: Option<ErrorEnvelope>,
}

/// `StreamEvent`. `kind` reuses the engine's own event-kind
/// enum: its `SCREAMING_SNAKE_CASE` wire rendering already matches the
/// spec's `kind ∈ {STATUS_CHANGED, ...}` vocabulary verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
  pub execution_id: Uuid,
  pub version: i64,
  pub kind: EngineEventKind,
  pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvideStepInputRequest {
  pub execution_id: Uuid,
  pub step_id: String,
  #[serde(default)]
  pub input: ContextPayload,
}

/// `ErrorEnvelope`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
  pub code: EngineErrorCode,
  pub message: String,
  pub retryable: bool,
  pub details: Option<serde_json::Value>,
}

impl From<EngineError> for ErrorEnvelope {
  fn from(err: EngineError) -> Self {
    ErrorEnvelope { code: err.code(), retryable: err.retryable(), message: err.to_string(), details: None }
  }
}

impl From<ErrorInfo> for ErrorEnvelope {
  fn from(info: ErrorInfo) -> Self {
    ErrorEnvelope { code: info.code, message: info.message, retryable: info.retryable, details: info.details }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListWorkflowsQuery {
  pub category: Option<String>,
  #[serde(default)]
  pub page: workflow_core::Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListExecutionsQuery {
  pub principal_id: String,
  #[serde(default)]
  pub page: workflow_core::Pagination,
}
