// DATA_COLLECTION executor: validates a declared field set
// against `config.fields` and emits a delta with the collected values.
// Grounded on `chem-workflow::flows::cadma_flow::steps::family_reference_step1`'s
// shape (a step that validates a JSON input against a small schema before
// emitting its payload), generalized from a fixed struct to a data-driven
// `Vec<FieldSpec>`.
use indexmap::IndexMap;
use regex::Regex;
use workflow_core::{ContextValue, EngineErrorCode, FieldSpec, FieldType, StepSpec};

use crate::executor::{Executor, StepContext, StepOutcome};

#[derive(serde::Deserialize)]
struct Config {
  fields: Vec<FieldSpec>,
}

pub struct DataCollectionExecutor;

impl DataCollectionExecutor {
  fn config(step: &StepSpec) -> Result<Config, StepOutcome> {
    serde_json::from_value(step.config.clone()).map_err(|e| StepOutcome::Failed {
      code: EngineErrorCode::IncompatibleStepConfig,
      message: format!("invalid DATA_COLLECTION config for step '{}': {e}", step.id),
      retryable: false,
    })
  }

  /// Validates one submitted value against its field spec. Returns the
  /// first-failing field's message: the engine surfaces the
  /// first-failing field as `ValidationFailed`.
  fn validate_field(field: &FieldSpec, value: &ContextValue) -> Result<(), String> {
    match field.field_type {
      FieldType::String => {
        let s = value.as_str().ok_or_else(|| format!("field '{}' must be a string", field.name))?;
        if let Some(pattern) = &field.pattern {
          let re = Regex::new(pattern).map_err(|e| format!("field '{}' has an invalid pattern: {e}", field.name))?;
          if !re.is_match(s) {
            return Err(format!("field '{}' does not match required pattern", field.name));
          }
        }
      }
      FieldType::Bool => {
        if value.as_bool().is_none() {
          return Err(format!("field '{}' must be a bool", field.name));
        }
      }
      FieldType::Timestamp => {
        if !matches!(value, ContextValue::Timestamp(_)) {
          return Err(format!("field '{}' must be a timestamp", field.name));
        }
      }
      FieldType::Integer | FieldType::Decimal => {
        let n = value.as_decimal().ok_or_else(|| format!("field '{}' must be numeric", field.name))?;
        if field.field_type == FieldType::Integer && !matches!(value, ContextValue::Integer(_)) {
          return Err(format!("field '{}' must be an integer", field.name));
        }
        if let Some(min) = field.min {
          if n < min {
            return Err(format!("field '{}' is below minimum {min}", field.name));
          }
        }
        if let Some(max) = field.max {
          if n > max {
            return Err(format!("field '{}' is above maximum {max}", field.name));
          }
        }
      }
    }
    Ok(())
  }
}

#[async_trait::async_trait]
impl Executor for DataCollectionExecutor {
  fn validate_config(&self, config: &serde_json::Value) -> workflow_core::Result<()> {
    serde_json::from_value::<Config>(config.clone()).map(|_| ())
                                                      .map_err(|e| workflow_core::EngineError::IncompatibleStepConfig(e.to_string()))
  }

  fn output_keys(&self, step: &StepSpec) -> Vec<String> {
    Self::config(step).map(|c| c.fields.into_iter().map(|f| f.name).collect()).unwrap_or_default()
  }

  async fn execute(&self, step: &StepSpec, ctx: &StepContext) -> StepOutcome {
    let config = match Self::config(step) {
      Ok(c) => c,
      Err(outcome) => return outcome,
    };

    let missing: Vec<String> =
      config.fields.iter().filter(|f| f.required && ctx.get(&f.name).is_none()).map(|f| f.name.clone()).collect();
    if !missing.is_empty() {
      return StepOutcome::AwaitInput { prompt: format!("step '{}' requires: {}", step.id, missing.join(", ")),
                                        expected_keys: missing };
    }

    self.provide_input(step, ctx, IndexMap::new()).await
  }

  async fn provide_input(&self, step: &StepSpec, ctx: &StepContext, input: IndexMap<String, ContextValue>) -> StepOutcome {
    let config = match Self::config(step) {
      Ok(c) => c,
      Err(outcome) => return outcome,
    };

    let mut delta = IndexMap::new();
    for field in &config.fields {
      let value = input.get(&field.name).or_else(|| ctx.get(&field.name));
      match value {
        Some(v) => {
          if let Err(message) = Self::validate_field(field, v) {
            return StepOutcome::Failed { code: EngineErrorCode::ValidationFailed, message, retryable: true };
          }
          delta.insert(field.name.clone(), v.clone());
        }
        None if field.required => {
          return StepOutcome::AwaitInput { prompt: format!("step '{}' requires: {}", step.id, field.name),
                                            expected_keys: vec![field.name.clone()] };
        }
        None => {}
      }
    }
    StepOutcome::Done { delta }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::executor::StepContext;
  use providers::{MockAiProvider, MockMarketDataProvider};
  use serde_json::json;
  use std::sync::Arc;
  use tokio_util::sync::CancellationToken;
  use workflow_core::{ContextSnapshot, StepKind};

  fn ctx(data: IndexMap<String, ContextValue>) -> StepContext {
    StepContext { snapshot: ContextSnapshot { data, version: 0 },
                  market_data: Arc::new(MockMarketDataProvider::new()),
                  ai: Arc::new(MockAiProvider::new()),
                  cancellation: CancellationToken::new() }
  }

  fn step() -> StepSpec {
    StepSpec { id: "a".into(),
               name: "a".into(),
               description: String::new(),
               kind: StepKind::DataCollection,
               config: json!({ "fields": [
                 { "name": "risk_tolerance", "type": "string", "required": true }
               ] }),
               dependencies: Default::default(),
               ai_prompt: None,
               validation_rules: None }
  }

  #[tokio::test]
  async fn awaits_input_when_required_field_missing() {
    let outcome = DataCollectionExecutor.execute(&step(), &ctx(IndexMap::new())).await;
    assert!(matches!(outcome, StepOutcome::AwaitInput { .. }));
  }

  #[tokio::test]
  async fn completes_once_field_is_provided() {
    let mut input = IndexMap::new();
    input.insert("risk_tolerance".to_string(), ContextValue::String("moderate".into()));
    let outcome = DataCollectionExecutor.provide_input(&step(), &ctx(IndexMap::new()), input).await;
    match outcome {
      StepOutcome::Done { delta } => {
        assert_eq!(delta.get("risk_tolerance").and_then(|v| v.as_str()), Some("moderate"));
      }
      other => panic!("expected Done, got {other:?}"),
    }
  }
}
