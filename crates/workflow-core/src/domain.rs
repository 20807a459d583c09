// Data model: workflow definitions, step specs, executions,
// step executions and the tagged-variant context value. Plain serde
// structs, the same way `flow::domain` defines `FlowData`/`FlowMeta` for
// cross-crate consumption.
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::EngineErrorCode;

/// The six built-in step kinds, i.e. `StepSpec.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
  DataCollection,
  Decision,
  Validation,
  UserInteraction,
  AiGenerated,
  Automated,
}

impl std::fmt::Display for StepKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      StepKind::DataCollection => "DATA_COLLECTION",
      StepKind::Decision => "DECISION",
      StepKind::Validation => "VALIDATION",
      StepKind::UserInteraction => "USER_INTERACTION",
      StepKind::AiGenerated => "AI_GENERATED",
      StepKind::Automated => "AUTOMATED",
    };
    write!(f, "{s}")
  }
}

/// Tagged-variant value stored in a `Context`. No
/// user-defined opaque blobs are permitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ContextValue {
  Null,
  Bool(bool),
  Integer(i64),
  /// Fixed-precision decimal, used for monetary and weight values.
  Decimal(Decimal),
  String(String),
  Timestamp(DateTime<Utc>),
  List(Vec<ContextValue>),
  Map(IndexMap<String, ContextValue>),
}

impl ContextValue {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      ContextValue::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_decimal(&self) -> Option<Decimal> {
    match self {
      ContextValue::Decimal(d) => Some(*d),
      ContextValue::Integer(i) => Some(Decimal::from(*i)),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      ContextValue::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&[ContextValue]> {
    match self {
      ContextValue::List(v) => Some(v),
      _ => None,
    }
  }
}

impl From<&str> for ContextValue {
  fn from(s: &str) -> Self {
    ContextValue::String(s.to_string())
  }
}

impl From<bool> for ContextValue {
  fn from(b: bool) -> Self {
    ContextValue::Bool(b)
  }
}

impl ContextValue {
  /// Converts a plain (untagged) JSON value into a `ContextValue`, the
  /// shape AI responses, validation-rule parameters, and boundary-layer
  /// `initial_context` payloads arrive in. This is deliberately distinct
  /// from the `Serialize`/`Deserialize` derive above, which round-trips
  /// through the tagged `{"type":...,"value":...}` wire format used for
  /// storage so `Integer` and `Decimal` never collide on the wire.
  pub fn from_plain_json(value: serde_json::Value) -> Self {
    match value {
      serde_json::Value::Null => ContextValue::Null,
      serde_json::Value::Bool(b) => ContextValue::Bool(b),
      serde_json::Value::Number(n) => {
        if let Some(i) = n.as_i64() {
          ContextValue::Integer(i)
        } else {
          ContextValue::Decimal(n.as_f64().and_then(Decimal::from_f64_retain).unwrap_or_default())
        }
      }
      serde_json::Value::String(s) => ContextValue::String(s),
      serde_json::Value::Array(items) => ContextValue::List(items.into_iter().map(Self::from_plain_json).collect()),
      serde_json::Value::Object(map) => {
        ContextValue::Map(map.into_iter().map(|(k, v)| (k, Self::from_plain_json(v))).collect())
      }
    }
  }

  /// Inverse of `from_plain_json`. Decimal values round-trip through `f64`,
  /// which is lossy for amounts needing more than ~15 significant digits;
  /// acceptable here since this path feeds JSON interop (AI prompts,
  /// validation comparisons, wire DTOs), never the engine's own decimal
  /// arithmetic, which stays in `rust_decimal` throughout.
  pub fn to_plain_json(&self) -> serde_json::Value {
    match self {
      ContextValue::Null => serde_json::Value::Null,
      ContextValue::Bool(b) => serde_json::Value::Bool(*b),
      ContextValue::Integer(i) => serde_json::Value::from(*i),
      ContextValue::Decimal(d) => serde_json::Number::from_f64(d.to_string().parse().unwrap_or(0.0))
                                                       .map(serde_json::Value::Number)
                                                       .unwrap_or(serde_json::Value::Null),
      ContextValue::String(s) => serde_json::Value::String(s.clone()),
      ContextValue::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
      ContextValue::List(items) => serde_json::Value::Array(items.iter().map(Self::to_plain_json).collect()),
      ContextValue::Map(map) => {
        serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_plain_json())).collect())
      }
    }
  }
}

/// A single field constraint used by the DATA_COLLECTION executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
  pub name: String,
  #[serde(rename = "type")]
  pub field_type: FieldType,
  #[serde(default)]
  pub required: bool,
  pub min: Option<Decimal>,
  pub max: Option<Decimal>,
  pub pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
  String,
  Integer,
  Decimal,
  Bool,
  Timestamp,
}

/// Post-step validation rule evaluated by the engine before a result is
/// committed, i.e. `StepSpec.validation_rules`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRule {
  pub name: String,
  pub predicate: String,
  #[serde(default)]
  pub parameters: serde_json::Value,
}

/// A single step in a `WorkflowDefinition`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub description: String,
  pub kind: StepKind,
  #[serde(default)]
  pub config: serde_json::Value,
  #[serde(default)]
  pub dependencies: BTreeSet<String>,
  pub ai_prompt: Option<String>,
  pub validation_rules: Option<Vec<ValidationRule>>,
}

/// Immutable, versioned workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
  pub id: String,
  pub version: i64,
  pub name: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub category: String,
  pub steps: Vec<StepSpec>,
  pub entry_points: BTreeSet<String>,
  pub exit_points: BTreeSet<String>,
  #[serde(default)]
  pub ai_configurable: bool,
}

impl WorkflowDefinition {
  pub fn step(&self, id: &str) -> Option<&StepSpec> {
    self.steps.iter().find(|s| s.id == id)
  }
}

/// A caller-submitted definition prior to version assignment, as taken
/// by `Register(def)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinitionInput {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub category: String,
  pub steps: Vec<StepSpec>,
  pub entry_points: BTreeSet<String>,
  pub exit_points: BTreeSet<String>,
  #[serde(default)]
  pub ai_configurable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
  pub id: String,
  pub version: i64,
  pub name: String,
  pub category: String,
  pub ai_configurable: bool,
}

impl From<&WorkflowDefinition> for WorkflowSummary {
  fn from(d: &WorkflowDefinition) -> Self {
    Self { id: d.id.clone(),
           version: d.version,
           name: d.name.clone(),
           category: d.category.clone(),
           ai_configurable: d.ai_configurable }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
  Pending,
  Running,
  Paused,
  Completed,
  Failed,
  Cancelled,
}

impl ExecutionStatus {
  /// Terminal states are write-once.
  pub fn is_terminal(self) -> bool {
    matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
  Pending,
  Running,
  AwaitingInput,
  Completed,
  Failed,
  Skipped,
}

impl StepStatus {
  /// A dependency counts as satisfied for scheduling purposes once it is
  /// COMPLETED, or SKIPPED in a way that still allows downstream steps to
  /// run.
  pub fn is_terminal(self) -> bool {
    matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
  pub code: EngineErrorCode,
  pub message: String,
  pub retryable: bool,
  pub details: Option<serde_json::Value>,
}

/// Mutable per-execution record, owned exclusively by the execution state
/// machine: `WorkflowExecution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
  pub execution_id: Uuid,
  pub workflow_id: String,
  pub workflow_version: i64,
  pub principal_id: String,
  pub session_id: String,
  pub status: ExecutionStatus,
  pub current_steps: BTreeSet<String>,
  pub started_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  pub error: Option<ErrorInfo>,
}

/// One attempt of a single step within an execution: `StepExecution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
  pub execution_id: Uuid,
  pub step_id: String,
  pub status: StepStatus,
  pub attempt: u32,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
  pub duration_ms: Option<i64>,
  pub input_snapshot: serde_json::Value,
  pub output: Option<serde_json::Value>,
  pub error: Option<ErrorInfo>,
}

/// One atomic append to a `Context` ("each step's write is an
/// atomic commit of a value-delta keyed by step id").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextCommit {
  pub id: Uuid,
  pub execution_id: Uuid,
  pub version: i64,
  pub step_id: String,
  pub delta: IndexMap<String, ContextValue>,
  pub committed_at: DateTime<Utc>,
}

/// A consistent, repeatable-read view of a `Context` at a given version,
/// i.e. a `Snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextSnapshot {
  pub data: IndexMap<String, ContextValue>,
  pub version: i64,
}

/// Outcome of a conditional `Commit`.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistResult {
  Ok { new_version: i64 },
  Conflict,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
  pub page: u32,
  pub page_size: u32,
}

impl Default for Pagination {
  fn default() -> Self {
    Self { page: 0, page_size: 20 }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
  pub items: Vec<T>,
  pub total: usize,
  pub page: u32,
}
