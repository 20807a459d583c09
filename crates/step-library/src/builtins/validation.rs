// VALIDATION executor: runs a declared set of check
// descriptors against the current context. Shares `evaluate_rule` with the
// engine's own post-step `validation_rules` (`StepSpec.validation_rules`,
// evaluated after the executor returns, before the result is committed)
// so the same predicate vocabulary backs both mechanisms instead of two
// parallel implementations.
use indexmap::IndexMap;
use rust_decimal::Decimal;
use workflow_core::{ContextSnapshot, ContextValue, EngineErrorCode, StepSpec, ValidationRule};

use crate::executor::{Executor, StepContext, StepOutcome, TOLERANCE};

#[derive(serde::Deserialize)]
struct Config {
  checks: Vec<ValidationRule>,
  #[serde(default)]
  halt_on_fail: bool,
}

/// Evaluates one predicate against a context snapshot. Returns `Ok(())` on
/// pass, `Err(message)` on failure. Unknown predicates fail closed.
pub fn evaluate_rule(rule: &ValidationRule, snapshot: &ContextSnapshot) -> Result<(), String> {
  let params = &rule.parameters;
  match rule.predicate.as_str() {
    "exists" => {
      let key = param_str(params, "key")?;
      if snapshot.data.contains_key(&key) {
        Ok(())
      } else {
        Err(format!("check '{}': key '{key}' is missing from context", rule.name))
      }
    }
    "equals" => {
      let key = param_str(params, "key")?;
      let expected = params.get("value").cloned().unwrap_or(serde_json::Value::Null);
      let actual = snapshot.data.get(&key).map(ContextValue::to_plain_json);
      if actual.as_ref() == Some(&expected) {
        Ok(())
      } else {
        Err(format!("check '{}': key '{key}' expected {expected} but was {:?}", rule.name, actual))
      }
    }
    "in_range" => {
      let key = param_str(params, "key")?;
      let value = snapshot.data
                          .get(&key)
                          .and_then(|v| v.as_decimal())
                          .ok_or_else(|| format!("check '{}': key '{key}' is missing or non-numeric", rule.name))?;
      let min = param_decimal(params, "min").unwrap_or(Decimal::MIN);
      let max = param_decimal(params, "max").unwrap_or(Decimal::MAX);
      if value >= min && value <= max {
        Ok(())
      } else {
        Err(format!("check '{}': key '{key}' value {value} is outside [{min}, {max}]", rule.name))
      }
    }
    "sum_equals" => {
      let keys = params.get("keys")
                       .and_then(|v| v.as_array())
                       .ok_or_else(|| format!("check '{}': missing 'keys' array parameter", rule.name))?;
      let target = param_decimal(params, "target").unwrap_or(Decimal::ONE);
      let tolerance = param_decimal(params, "tolerance").unwrap_or(*TOLERANCE);
      let mut sum = Decimal::ZERO;
      for k in keys {
        let k = k.as_str().ok_or_else(|| format!("check '{}': 'keys' must be strings", rule.name))?;
        let value = snapshot.data
                            .get(k)
                            .and_then(|v| v.as_decimal())
                            .ok_or_else(|| format!("check '{}': key '{k}' is missing or non-numeric", rule.name))?;
        sum += value;
      }
      if (sum - target).abs() <= tolerance {
        Ok(())
      } else {
        Err(format!("check '{}': sum {sum} does not equal target {target} within tolerance {tolerance}", rule.name))
      }
    }
    "regex_match" => {
      let key = param_str(params, "key")?;
      let pattern = param_str(params, "pattern")?;
      let re = regex::Regex::new(&pattern).map_err(|e| format!("check '{}': invalid pattern: {e}", rule.name))?;
      let value = snapshot.data
                          .get(&key)
                          .and_then(|v| v.as_str())
                          .ok_or_else(|| format!("check '{}': key '{key}' is missing or non-string", rule.name))?;
      if re.is_match(value) {
        Ok(())
      } else {
        Err(format!("check '{}': key '{key}' does not match pattern", rule.name))
      }
    }
    other => Err(format!("check '{}': unknown predicate '{other}'", rule.name)),
  }
}

fn param_str(params: &serde_json::Value, key: &str) -> Result<String, String> {
  params.get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| format!("missing string parameter '{key}'"))
}

fn param_decimal(params: &serde_json::Value, key: &str) -> Option<Decimal> {
  params.get(key).and_then(|v| v.as_f64()).and_then(Decimal::from_f64_retain)
}

pub struct ValidationExecutor;

#[async_trait::async_trait]
impl Executor for ValidationExecutor {
  fn validate_config(&self, config: &serde_json::Value) -> workflow_core::Result<()> {
    serde_json::from_value::<Config>(config.clone()).map(|_| ())
                                                      .map_err(|e| workflow_core::EngineError::IncompatibleStepConfig(e.to_string()))
  }

  fn output_keys(&self, step: &StepSpec) -> Vec<String> {
    vec![format!("validation_{}", step.id)]
  }

  async fn execute(&self, step: &StepSpec, ctx: &StepContext) -> StepOutcome {
    let config: Config = match serde_json::from_value(step.config.clone()) {
      Ok(c) => c,
      Err(e) => {
        return StepOutcome::Failed { code: EngineErrorCode::IncompatibleStepConfig,
                                      message: format!("invalid VALIDATION config for step '{}': {e}", step.id),
                                      retryable: false }
      }
    };

    let mut first_failure: Option<String> = None;
    let mut checks = Vec::new();
    for rule in &config.checks {
      let result = evaluate_rule(rule, &ctx.snapshot);
      let passed = result.is_ok();
      if let Err(message) = &result {
        if first_failure.is_none() {
          first_failure = Some(message.clone());
        }
      }
      let mut row = IndexMap::new();
      row.insert("name".to_string(), ContextValue::String(rule.name.clone()));
      row.insert("passed".to_string(), ContextValue::Bool(passed));
      row.insert("message".to_string(),
                 ContextValue::String(result.err().unwrap_or_else(|| "ok".to_string())));
      checks.push(ContextValue::Map(row));
    }

    if let Some(message) = first_failure {
      if config.halt_on_fail {
        return StepOutcome::Failed { code: EngineErrorCode::ValidationFailed, message, retryable: true };
      }
    }

    let mut summary = IndexMap::new();
    summary.insert("passed".to_string(), ContextValue::Bool(first_failure.is_none()));
    summary.insert("checks".to_string(), ContextValue::List(checks));

    let mut delta = IndexMap::new();
    delta.insert(format!("validation_{}", step.id), ContextValue::Map(summary));
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
  use workflow_core::StepKind;

  fn ctx(data: IndexMap<String, ContextValue>) -> StepContext {
    StepContext { snapshot: ContextSnapshot { data, version: 1 },
                  market_data: Arc::new(MockMarketDataProvider::new()),
                  ai: Arc::new(MockAiProvider::new()),
                  cancellation: CancellationToken::new() }
  }

  fn step(halt_on_fail: bool) -> StepSpec {
    StepSpec { id: "v".into(),
               name: "v".into(),
               description: String::new(),
               kind: StepKind::Validation,
               config: json!({
                 "checks": [
                   { "name": "has_decision", "predicate": "exists", "parameters": { "key": "decision_b" } }
                 ],
                 "halt_on_fail": halt_on_fail
               }),
               dependencies: Default::default(),
               ai_prompt: None,
               validation_rules: None }
  }

  #[tokio::test]
  async fn reports_all_checks_when_not_halting() {
    let outcome = ValidationExecutor.execute(&step(false), &ctx(IndexMap::new())).await;
    match outcome {
      StepOutcome::Done { delta } => {
        let summary = delta.get("validation_v").unwrap();
        if let ContextValue::Map(m) = summary {
          assert_eq!(m.get("passed"), Some(&ContextValue::Bool(false)));
        } else {
          panic!("expected a map");
        }
      }
      other => panic!("expected Done, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn halts_with_a_retryable_failure_when_configured() {
    let outcome = ValidationExecutor.execute(&step(true), &ctx(IndexMap::new())).await;
    assert!(matches!(outcome, StepOutcome::Failed { retryable: true, .. }));
  }

  #[tokio::test]
  async fn passes_when_the_check_is_satisfied() {
    let mut data = IndexMap::new();
    data.insert("decision_b".into(), ContextValue::String("balanced".into()));
    let outcome = ValidationExecutor.execute(&step(true), &ctx(data)).await;
    assert!(matches!(outcome, StepOutcome::Done { .. }));
  }
}
