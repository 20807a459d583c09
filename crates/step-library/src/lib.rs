//! Step Library: a pure catalogue of step kinds, their
//! dispatch targets, and the config schema each owns. Registration is
//! static for built-in kinds — the catalogue is built once, behind a
//! `once_cell::sync::Lazy`, mirroring the `static ENGINE: Lazy<...>`
//! pattern molecule registries in this codebase have used historically —
//! and never mutated after process start; there is no runtime
//! registration during execution.

pub mod builtins;
pub mod executor;

pub use executor::{Executor, StepContext, StepOutcome, CURRENCY_SCALE, TOLERANCE, WEIGHT_SCALE};

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use workflow_core::{EngineError, Result, StepKind};

use builtins::{
  AiGeneratedExecutor, AutomatedExecutor, DataCollectionExecutor, DecisionExecutor, UserInteractionExecutor,
  ValidationExecutor,
};

static BUILTIN_EXECUTORS: Lazy<HashMap<StepKind, Arc<dyn Executor>>> = Lazy::new(|| {
  let mut table: HashMap<StepKind, Arc<dyn Executor>> = HashMap::new();
  table.insert(StepKind::DataCollection, Arc::new(DataCollectionExecutor));
  table.insert(StepKind::Decision, Arc::new(DecisionExecutor));
  table.insert(StepKind::Validation, Arc::new(ValidationExecutor));
  table.insert(StepKind::UserInteraction, Arc::new(UserInteractionExecutor));
  table.insert(StepKind::AiGenerated, Arc::new(AiGeneratedExecutor));
  table.insert(StepKind::Automated, Arc::new(AutomatedExecutor));
  table
});

/// Dispatch-key → executor catalogue. Built-ins are
/// always present; `with_executor` lets a process register additional
/// kinds once at startup, before any workflow executes.
#[derive(Clone)]
pub struct StepLibrary {
  executors: HashMap<StepKind, Arc<dyn Executor>>,
}

impl Default for StepLibrary {
  fn default() -> Self {
    Self { executors: BUILTIN_EXECUTORS.clone() }
  }
}

impl StepLibrary {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_executor(mut self, kind: StepKind, executor: Arc<dyn Executor>) -> Self {
    self.executors.insert(kind, executor);
    self
  }

  /// Resolves the executor for `kind`. Fails with `UnknownStepKind` on a
  /// lookup miss.
  pub fn resolve(&self, kind: StepKind) -> Result<Arc<dyn Executor>> {
    self.executors.get(&kind).cloned().ok_or_else(|| EngineError::UnknownStepKind(kind.to_string()))
  }

  /// Validates a step's config against its kind's schema, raising
  /// `IncompatibleStepConfig` on failure. Used by
  /// `WorkflowRegistry::register` at definition registration time.
  pub fn validate_config(&self, kind: StepKind, config: &serde_json::Value) -> Result<()> {
    self.resolve(kind)?.validate_config(config)
  }

  /// Declared output keys for `step`, used by the scheduler to serialize
  /// steps whose commits would otherwise race. Returns an
  /// empty list if the step's kind is unknown or its config doesn't parse;
  /// such a step simply never conflicts with another.
  pub fn output_keys(&self, step: &workflow_core::StepSpec) -> Vec<String> {
    self.resolve(step.kind).map(|e| e.output_keys(step)).unwrap_or_default()
  }

  /// Adapts this library into the `workflow_core::ConfigValidator`
  /// callback `WorkflowRegistry::register` invokes per step, keeping
  /// `workflow-core` free of a direct dependency on the step library.
  pub fn config_validator(self: &Arc<Self>) -> workflow_core::ConfigValidator {
    let library = Arc::clone(self);
    Arc::new(move |kind, config| library.validate_config(kind, config))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn resolves_every_built_in_kind() {
    let library = StepLibrary::new();
    for kind in [
      StepKind::DataCollection,
      StepKind::Decision,
      StepKind::Validation,
      StepKind::UserInteraction,
      StepKind::AiGenerated,
      StepKind::Automated,
    ] {
      assert!(library.resolve(kind).is_ok());
    }
  }

  #[test]
  fn rejects_a_decision_step_with_no_options() {
    let library = StepLibrary::new();
    let err = library.validate_config(StepKind::Decision, &serde_json::json!({ "inputType": "single", "options": [] }))
                      .unwrap_err();
    assert!(matches!(err, EngineError::IncompatibleStepConfig(_)));
  }
}
