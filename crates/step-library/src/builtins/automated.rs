// AUTOMATED executor: an escape hatch for deterministic
// in-process transforms. Must not perform I/O other than through supplied
// provider interfaces (market data); dispatch is keyed by
// `config.transform`, the same "small named-operation table" shape the
// VALIDATION executor uses for predicates.
use indexmap::IndexMap;
use rust_decimal::Decimal;
use workflow_core::{ContextValue, EngineErrorCode, StepSpec};

use crate::executor::{Executor, StepContext, StepOutcome, WEIGHT_SCALE};

#[derive(serde::Deserialize)]
#[serde(tag = "transform", rename_all = "snake_case")]
enum Config {
  /// Rescales `weights_key` (a map of label -> weight) so its values sum
  /// to `target` (default 1) at `WEIGHT_SCALE` fractional digits.
  NormalizeWeights { weights_key: String, target: Option<Decimal>, output_key: String },
  /// Fetches a market-data series through the injected provider and
  /// stores it verbatim under `output_key`.
  FetchMarketData { symbol: String, window: String, output_key: String },
  /// Copies one context key to another unchanged; used for wiring
  /// trivial passthrough steps in tests and demos.
  Passthrough { input_key: String, output_key: String },
  /// Emits a literal value under `output_key` with no dependency on the
  /// rest of the context; used for workflow-authored flags and markers
  /// (e.g. a completion marker a downstream step's dependency gates on).
  SetConstant { output_key: String, value: serde_json::Value },
}

pub struct AutomatedExecutor;

#[async_trait::async_trait]
impl Executor for AutomatedExecutor {
  fn validate_config(&self, config: &serde_json::Value) -> workflow_core::Result<()> {
    serde_json::from_value::<Config>(config.clone()).map(|_| ())
                                                      .map_err(|e| workflow_core::EngineError::IncompatibleStepConfig(e.to_string()))
  }

  fn output_keys(&self, step: &StepSpec) -> Vec<String> {
    match serde_json::from_value::<Config>(step.config.clone()) {
      Ok(Config::NormalizeWeights { output_key, .. })
      | Ok(Config::FetchMarketData { output_key, .. })
      | Ok(Config::Passthrough { output_key, .. })
      | Ok(Config::SetConstant { output_key, .. }) => vec![output_key],
      Err(_) => Vec::new(),
    }
  }

  async fn execute(&self, step: &StepSpec, ctx: &StepContext) -> StepOutcome {
    let config: Config = match serde_json::from_value(step.config.clone()) {
      Ok(c) => c,
      Err(e) => {
        return StepOutcome::Failed { code: EngineErrorCode::IncompatibleStepConfig,
                                      message: format!("invalid AUTOMATED config for step '{}': {e}", step.id),
                                      retryable: false }
      }
    };

    match config {
      Config::NormalizeWeights { weights_key, target, output_key } => {
        let target = target.unwrap_or(Decimal::ONE);
        let Some(ContextValue::Map(weights)) = ctx.get(&weights_key) else {
          return StepOutcome::Failed {
            code: EngineErrorCode::ValidationFailed,
            message: format!("step '{}': key '{weights_key}' is not a weight map", step.id),
            retryable: false,
          };
        };
        let mut numeric: IndexMap<String, Decimal> = IndexMap::new();
        for (k, v) in weights {
          let Some(d) = v.as_decimal() else {
            return StepOutcome::Failed { code: EngineErrorCode::ValidationFailed,
                                          message: format!("step '{}': weight '{k}' is not numeric", step.id),
                                          retryable: false };
          };
          numeric.insert(k.clone(), d);
        }
        let sum: Decimal = numeric.values().sum();
        if sum.is_zero() {
          return StepOutcome::Failed { code: EngineErrorCode::ValidationFailed,
                                        message: format!("step '{}': weights sum to zero, cannot normalize", step.id),
                                        retryable: false };
        }
        let mut normalized = IndexMap::new();
        for (k, v) in numeric {
          let scaled = (v / sum * target).round_dp(WEIGHT_SCALE);
          normalized.insert(k, ContextValue::Decimal(scaled));
        }
        let mut delta = IndexMap::new();
        delta.insert(output_key, ContextValue::Map(normalized));
        StepOutcome::Done { delta }
      }

      Config::FetchMarketData { symbol, window, output_key } => match ctx.market_data.fetch_series(&symbol, &window).await {
        Ok(series) => {
          let points = series.into_iter()
                             .map(|p| {
                               let mut row = IndexMap::new();
                               row.insert("timestamp".to_string(), ContextValue::Timestamp(p.timestamp));
                               row.insert("value".to_string(), ContextValue::Decimal(p.value));
                               ContextValue::Map(row)
                             })
                             .collect();
          let mut delta = IndexMap::new();
          delta.insert(output_key, ContextValue::List(points));
          StepOutcome::Done { delta }
        }
        Err(e) if e.retryable() => {
          StepOutcome::Failed { code: EngineErrorCode::Transient, message: e.to_string(), retryable: true }
        }
        Err(e) => StepOutcome::Failed { code: EngineErrorCode::Internal, message: e.to_string(), retryable: false },
      },

      Config::Passthrough { input_key, output_key } => match ctx.get(&input_key) {
        Some(value) => {
          let mut delta = IndexMap::new();
          delta.insert(output_key, value.clone());
          StepOutcome::Done { delta }
        }
        None => StepOutcome::Failed { code: EngineErrorCode::ValidationFailed,
                                       message: format!("step '{}': key '{input_key}' is missing", step.id),
                                       retryable: false },
      },

      Config::SetConstant { output_key, value } => {
        let mut delta = IndexMap::new();
        delta.insert(output_key, ContextValue::from_plain_json(value));
        StepOutcome::Done { delta }
      }
    }
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

  fn ctx(data: IndexMap<String, ContextValue>) -> StepContext {
    StepContext { snapshot: ContextSnapshot { data, version: 1 },
                  market_data: Arc::new(MockMarketDataProvider::new()),
                  ai: Arc::new(MockAiProvider::new()),
                  cancellation: CancellationToken::new() }
  }

  fn step() -> StepSpec {
    StepSpec { id: "c".into(),
               name: "c".into(),
               description: String::new(),
               kind: StepKind::Automated,
               config: json!({
                 "transform": "normalize_weights",
                 "weights_key": "raw_weights",
                 "output_key": "weights"
               }),
               dependencies: Default::default(),
               ai_prompt: None,
               validation_rules: None }
  }

  #[tokio::test]
  async fn normalizes_weights_to_sum_to_one() {
    let mut raw = IndexMap::new();
    raw.insert("stocks".to_string(), ContextValue::Decimal(Decimal::new(3, 0)));
    raw.insert("bonds".to_string(), ContextValue::Decimal(Decimal::new(1, 0)));
    let mut data = IndexMap::new();
    data.insert("raw_weights".to_string(), ContextValue::Map(raw));

    let outcome = AutomatedExecutor.execute(&step(), &ctx(data)).await;
    match outcome {
      StepOutcome::Done { delta } => {
        let ContextValue::Map(weights) = delta.get("weights").unwrap() else { panic!("expected map") };
        let sum: Decimal = weights.values().map(|v| v.as_decimal().unwrap()).sum();
        assert!((sum - Decimal::ONE).abs() <= *crate::executor::TOLERANCE);
      }
      other => panic!("expected Done, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn set_constant_emits_a_literal_value_with_no_context_dependency() {
    let step = StepSpec { id: "c".into(),
                           name: "c".into(),
                           description: String::new(),
                           kind: StepKind::Automated,
                           config: json!({
                             "transform": "set_constant",
                             "output_key": "profile_complete",
                             "value": true
                           }),
                           dependencies: Default::default(),
                           ai_prompt: None,
                           validation_rules: None };

    let outcome = AutomatedExecutor.execute(&step, &ctx(IndexMap::new())).await;
    match outcome {
      StepOutcome::Done { delta } => {
        assert_eq!(delta.get("profile_complete"), Some(&ContextValue::Bool(true)));
      }
      other => panic!("expected Done, got {other:?}"),
    }
  }
}
