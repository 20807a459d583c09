// USER_INTERACTION (selection) executor: presents a
// catalogue supplied via `config.items` or produced by a prior step, and
// enforces `minSelections`/`maxSelections`.
use indexmap::IndexMap;
use workflow_core::{ContextValue, EngineErrorCode, StepSpec};

use crate::executor::{Executor, StepContext, StepOutcome};

#[derive(serde::Deserialize)]
struct Config {
  items: Option<Vec<String>>,
  #[serde(rename = "itemsKey")]
  items_key: Option<String>,
  #[serde(rename = "minSelections", default)]
  min_selections: usize,
  #[serde(rename = "maxSelections")]
  max_selections: Option<usize>,
}

pub struct UserInteractionExecutor;

impl UserInteractionExecutor {
  fn key(step: &StepSpec) -> String {
    format!("selection_{}", step.id)
  }

  fn catalogue(config: &Config, ctx: &StepContext) -> Option<Vec<String>> {
    if let Some(items) = &config.items {
      return Some(items.clone());
    }
    let key = config.items_key.as_deref()?;
    ctx.get(key).and_then(|v| v.as_list()).map(|list| list.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
  }
}

#[async_trait::async_trait]
impl Executor for UserInteractionExecutor {
  fn validate_config(&self, config: &serde_json::Value) -> workflow_core::Result<()> {
    let parsed: Config = serde_json::from_value(config.clone())
      .map_err(|e| workflow_core::EngineError::IncompatibleStepConfig(e.to_string()))?;
    if parsed.items.is_none() && parsed.items_key.is_none() {
      return Err(workflow_core::EngineError::IncompatibleStepConfig(
        "USER_INTERACTION step declares neither 'items' nor 'itemsKey'".into(),
      ));
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
    StepOutcome::AwaitInput { prompt: format!("step '{}' awaits a selection", step.id),
                              expected_keys: vec!["selection".into()] }
  }

  async fn provide_input(&self, step: &StepSpec, ctx: &StepContext, input: IndexMap<String, ContextValue>) -> StepOutcome {
    let config: Config = match serde_json::from_value(step.config.clone()) {
      Ok(c) => c,
      Err(e) => {
        return StepOutcome::Failed { code: EngineErrorCode::IncompatibleStepConfig,
                                      message: format!("invalid USER_INTERACTION config for step '{}': {e}", step.id),
                                      retryable: false }
      }
    };

    let catalogue = match Self::catalogue(&config, ctx) {
      Some(c) if !c.is_empty() => c,
      _ => {
        return StepOutcome::Failed { code: EngineErrorCode::IncompatibleStepConfig,
                                      message: format!("step '{}' has no item catalogue", step.id),
                                      retryable: false }
      }
    };

    let selection = input.get("selection")
                         .cloned()
                         .or_else(|| ctx.get(&Self::key(step)).cloned());
    let selected: Vec<String> = match selection {
      Some(ContextValue::List(items)) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
      Some(ContextValue::String(s)) => vec![s],
      _ => {
        return StepOutcome::AwaitInput { prompt: format!("step '{}' awaits a selection", step.id),
                                          expected_keys: vec!["selection".into()] }
      }
    };

    for item in &selected {
      if !catalogue.iter().any(|c| c == item) {
        return StepOutcome::Failed { code: EngineErrorCode::ValidationFailed,
                                      message: format!("'{item}' is not in the catalogue for step '{}'", step.id),
                                      retryable: true };
      }
    }

    let max = config.max_selections.unwrap_or(catalogue.len());
    if selected.len() < config.min_selections || selected.len() > max {
      return StepOutcome::Failed {
        code: EngineErrorCode::ValidationFailed,
        message: format!("step '{}' requires between {} and {max} selections, got {}",
                          step.id,
                          config.min_selections,
                          selected.len()),
        retryable: true,
      };
    }

    let mut delta = IndexMap::new();
    delta.insert(Self::key(step), ContextValue::List(selected.into_iter().map(ContextValue::String).collect()));
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
    StepSpec { id: "sel".into(),
               name: "sel".into(),
               description: String::new(),
               kind: StepKind::UserInteraction,
               config: json!({
                 "items": ["a", "b", "c", "d", "e"],
                 "minSelections": 2
               }),
               dependencies: Default::default(),
               ai_prompt: None,
               validation_rules: None }
  }

  #[tokio::test]
  async fn rejects_fewer_than_minimum_selections() {
    let mut input = IndexMap::new();
    input.insert("selection".into(), ContextValue::List(vec![ContextValue::String("a".into())]));
    let outcome = UserInteractionExecutor.provide_input(&step(), &ctx(), input).await;
    assert!(matches!(outcome, StepOutcome::Failed { retryable: true, .. }));
  }

  #[tokio::test]
  async fn accepts_selections_meeting_the_minimum() {
    let mut input = IndexMap::new();
    input.insert("selection".into(),
                 ContextValue::List(vec![ContextValue::String("a".into()), ContextValue::String("b".into())]));
    let outcome = UserInteractionExecutor.provide_input(&step(), &ctx(), input).await;
    assert!(matches!(outcome, StepOutcome::Done { .. }));
  }
}
