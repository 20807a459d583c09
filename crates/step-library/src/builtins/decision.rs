// DECISION executor: a single- or multi-select choice from
// a declared option list, producing `decision_{step_id}`.
use indexmap::IndexMap;
use serde::Deserialize;
use workflow_core::{ContextValue, EngineErrorCode, StepSpec};

use crate::executor::{Executor, StepContext, StepOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum InputType {
  Single,
  Multi,
  Dropdown,
}

#[derive(Deserialize)]
struct Config {
  #[serde(rename = "inputType")]
  input_type: InputType,
  options: Vec<String>,
  #[serde(rename = "minSelections")]
  min_selections: Option<usize>,
  #[serde(rename = "maxSelections")]
  max_selections: Option<usize>,
}

pub struct DecisionExecutor;

impl DecisionExecutor {
  fn config(step: &StepSpec) -> Result<Config, StepOutcome> {
    let config: Config = serde_json::from_value(step.config.clone()).map_err(|e| StepOutcome::Failed {
      code: EngineErrorCode::IncompatibleStepConfig,
      message: format!("invalid DECISION config for step '{}': {e}", step.id),
      retryable: false,
    })?;
    if config.options.is_empty() {
      return Err(StepOutcome::Failed { code: EngineErrorCode::IncompatibleStepConfig,
                                        message: format!("step '{}' declares no options", step.id),
                                        retryable: false });
    }
    Ok(config)
  }

  fn key(step: &StepSpec) -> String {
    format!("decision_{}", step.id)
  }
}

#[async_trait::async_trait]
impl Executor for DecisionExecutor {
  fn validate_config(&self, config: &serde_json::Value) -> workflow_core::Result<()> {
    let parsed: Config = serde_json::from_value(config.clone())
      .map_err(|e| workflow_core::EngineError::IncompatibleStepConfig(e.to_string()))?;
    if parsed.options.is_empty() {
      return Err(workflow_core::EngineError::IncompatibleStepConfig("DECISION step declares no options".into()));
    }
    Ok(())
  }

  fn output_keys(&self, step: &StepSpec) -> Vec<String> {
    vec![Self::key(step)]
  }

  async fn execute(&self, step: &StepSpec, ctx: &StepContext) -> StepOutcome {
    if ctx.get(&Self::key(step)).is_some() {
      return self.provide_input(step, ctx, IndexMap::new()).await;
    }
    StepOutcome::AwaitInput { prompt: format!("step '{}' awaits a decision", step.id),
                              expected_keys: vec!["chosen".into()] }
  }

  async fn provide_input(&self, step: &StepSpec, ctx: &StepContext, input: IndexMap<String, ContextValue>) -> StepOutcome {
    let config = match Self::config(step) {
      Ok(c) => c,
      Err(outcome) => return outcome,
    };

    let chosen = input.get("chosen").cloned().or_else(|| ctx.get(&Self::key(step)).cloned());
    let chosen = match chosen {
      Some(v) => v,
      None => {
        return StepOutcome::AwaitInput { prompt: format!("step '{}' awaits a decision", step.id),
                                          expected_keys: vec!["chosen".into()] }
      }
    };

    let chosen_values: Vec<String> = match (&config.input_type, &chosen) {
      (InputType::Multi, ContextValue::List(items)) => {
        items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
      }
      (InputType::Multi, other) => other.as_str().map(|s| vec![s.to_string()]).unwrap_or_default(),
      (_, other) => match other.as_str() {
        Some(s) => vec![s.to_string()],
        None => {
          return StepOutcome::Failed { code: EngineErrorCode::ValidationFailed,
                                        message: format!("step '{}' expects a single string choice", step.id),
                                        retryable: true }
        }
      },
    };

    for value in &chosen_values {
      if !config.options.iter().any(|opt| opt == value) {
        return StepOutcome::Failed { code: EngineErrorCode::ValidationFailed,
                                      message: format!("'{value}' is not one of the declared options for step '{}'",
                                                        step.id),
                                      retryable: true };
      }
    }

    if config.input_type == InputType::Multi {
      let min = config.min_selections.unwrap_or(0);
      let max = config.max_selections.unwrap_or(config.options.len());
      if chosen_values.len() < min || chosen_values.len() > max {
        return StepOutcome::Failed { code: EngineErrorCode::ValidationFailed,
                                      message: format!("step '{}' requires between {min} and {max} selections, got {}",
                                                        step.id,
                                                        chosen_values.len()),
                                      retryable: true };
      }
    }

    let committed = if config.input_type == InputType::Multi {
      ContextValue::List(chosen_values.into_iter().map(ContextValue::String).collect())
    } else {
      ContextValue::String(chosen_values.into_iter().next().expect("validated non-empty above"))
    };

    let mut delta = IndexMap::new();
    delta.insert(Self::key(step), committed);
    StepOutcome::Done { delta }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use providers::{MockAiProvider, MockMarketDataProvider};
  use serde_json::json;
  use std::sync::Arc;
  use tokio_util::sync::CancellationToken;
  use workflow_core::{ContextSnapshot, StepKind};

  fn ctx() -> StepContext {
    StepContext { snapshot: ContextSnapshot::default(),
                  market_data: Arc::new(MockMarketDataProvider::new()),
                  ai: Arc::new(MockAiProvider::new()),
                  cancellation: CancellationToken::new() }
  }

  fn step() -> StepSpec {
    StepSpec { id: "b".into(),
               name: "b".into(),
               description: String::new(),
               kind: StepKind::Decision,
               config: json!({
                 "inputType": "single",
                 "options": ["conservative", "balanced", "aggressive"]
               }),
               dependencies: Default::default(),
               ai_prompt: None,
               validation_rules: None }
  }

  #[tokio::test]
  async fn rejects_a_choice_outside_the_option_list() {
    let mut input = IndexMap::new();
    input.insert("chosen".into(), ContextValue::String("yolo".into()));
    let outcome = DecisionExecutor.provide_input(&step(), &ctx(), input).await;
    assert!(matches!(outcome, StepOutcome::Failed { retryable: true, .. }));
  }

  #[tokio::test]
  async fn accepts_a_valid_choice() {
    let mut input = IndexMap::new();
    input.insert("chosen".into(), ContextValue::String("balanced".into()));
    let outcome = DecisionExecutor.provide_input(&step(), &ctx(), input).await;
    match outcome {
      StepOutcome::Done { delta } => assert_eq!(delta.get("decision_b").and_then(|v| v.as_str()), Some("balanced")),
      other => panic!("expected Done, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn enforces_min_selections_for_multi() {
    let step = StepSpec { config: json!({
                              "inputType": "multi",
                              "options": ["x", "y", "z"],
                              "minSelections": 2
                            }),
                          ..step() };
    let mut input = IndexMap::new();
    input.insert("chosen".into(), ContextValue::List(vec![ContextValue::String("x".into())]));
    let outcome = DecisionExecutor.provide_input(&step, &ctx(), input).await;
    assert!(matches!(outcome, StepOutcome::Failed { .. }));
  }
}
