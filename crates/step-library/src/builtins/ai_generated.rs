// AI_GENERATED executor: builds a prompt from `ai_prompt`
// plus a caller-allowlisted, sanitized subset of the context, calls the
// external completion provider, and validates the response against a
// declared schema. Tags its commit with the provider's model identifier
// and a content hash so retries can dedup
// instead of re-billing an identical completion.
use std::collections::HashSet;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use workflow_core::{ContextValue, EngineErrorCode, StepSpec};

use crate::executor::{Executor, StepContext, StepOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FieldType {
  String,
  Number,
  Bool,
  Object,
  Array,
  #[serde(rename = "map<string,number>")]
  MapStringNumber,
}

#[derive(Deserialize)]
struct SchemaField {
  key: String,
  #[serde(rename = "type")]
  field_type: FieldType,
}

#[derive(Deserialize)]
struct Config {
  response_schema: Vec<SchemaField>,
  #[serde(default)]
  allowed_context_keys: Vec<String>,
  #[serde(default)]
  sensitive_keys: Vec<String>,
}

pub struct AiGeneratedExecutor;

impl AiGeneratedExecutor {
  /// Sanitized context subset the prompt may reference: the outbound
  /// context must be sanitized, stripping any key flagged sensitive.
  /// There is no per-value sensitivity flag on `ContextValue` itself, so
  /// sensitivity is declared per step in `config.sensitive_keys`; see
  /// DESIGN.md for that resolution.
  fn sanitized_context(config: &Config, ctx: &StepContext) -> IndexMap<String, ContextValue> {
    let sensitive: HashSet<&str> = config.sensitive_keys.iter().map(String::as_str).collect();
    let mut out = IndexMap::new();
    for key in &config.allowed_context_keys {
      if sensitive.contains(key.as_str()) {
        continue;
      }
      if let Some(value) = ctx.get(key) {
        out.insert(key.clone(), value.clone());
      }
    }
    out
  }

  fn validate_response(schema: &[SchemaField], response: &JsonValue) -> Result<IndexMap<String, ContextValue>, String> {
    let object = response.as_object().ok_or("AI response is not a JSON object")?;
    let mut delta = IndexMap::new();
    for field in schema {
      let value = object.get(&field.key).ok_or_else(|| format!("AI response is missing key '{}'", field.key))?;
      let matches = match field.field_type {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Bool => value.is_boolean(),
        FieldType::Object => value.is_object(),
        FieldType::Array => value.is_array(),
        FieldType::MapStringNumber => {
          value.as_object().is_some_and(|m| m.values().all(|v| v.is_number()))
        }
      };
      if !matches {
        return Err(format!("AI response key '{}' does not match declared type", field.key));
      }
      delta.insert(field.key.clone(), ContextValue::from_plain_json(value.clone()));
    }
    Ok(delta)
  }
}

#[async_trait::async_trait]
impl Executor for AiGeneratedExecutor {
  fn validate_config(&self, config: &serde_json::Value) -> workflow_core::Result<()> {
    serde_json::from_value::<Config>(config.clone()).map(|_| ())
                                                      .map_err(|e| workflow_core::EngineError::IncompatibleStepConfig(e.to_string()))
  }

  fn output_keys(&self, step: &StepSpec) -> Vec<String> {
    let Ok(config) = serde_json::from_value::<Config>(step.config.clone()) else { return Vec::new() };
    let mut keys: Vec<String> = config.response_schema.into_iter().map(|f| f.key).collect();
    keys.push(format!("ai_model_{}", step.id));
    keys.push(format!("ai_content_hash_{}", step.id));
    keys
  }

  async fn execute(&self, step: &StepSpec, ctx: &StepContext) -> StepOutcome {
    let config: Config = match serde_json::from_value(step.config.clone()) {
      Ok(c) => c,
      Err(e) => {
        return StepOutcome::Failed { code: EngineErrorCode::IncompatibleStepConfig,
                                      message: format!("invalid AI_GENERATED config for step '{}': {e}", step.id),
                                      retryable: false }
      }
    };
    let Some(ai_prompt) = &step.ai_prompt else {
      return StepOutcome::Failed { code: EngineErrorCode::IncompatibleStepConfig,
                                    message: format!("step '{}' is AI_GENERATED but declares no ai_prompt", step.id),
                                    retryable: false };
    };

    let sanitized = Self::sanitized_context(&config, ctx);
    let context_json = serde_json::to_string(&sanitized).unwrap_or_default();
    let prompt = format!("{ai_prompt}\n\ncontext: {context_json}");

    let schema_json = serde_json::json!(config.response_schema
                                               .iter()
                                               .map(|f| f.key.clone())
                                               .collect::<Vec<_>>());

    let completion = match ctx.ai.complete(&prompt, &schema_json).await {
      Ok(c) => c,
      Err(e) if e.retryable() => {
        return StepOutcome::Failed { code: EngineErrorCode::Transient, message: e.to_string(), retryable: true }
      }
      Err(e) => return StepOutcome::Failed { code: EngineErrorCode::AiResponseInvalid, message: e.to_string(), retryable: false },
    };

    let parsed: JsonValue = match serde_json::from_str(&completion.text) {
      Ok(v) => v,
      Err(e) => {
        return StepOutcome::Failed {
          code: EngineErrorCode::AiResponseInvalid,
          message: format!("AI response was not valid JSON: {e}"),
          retryable: true,
        }
      }
    };

    let mut delta = match Self::validate_response(&config.response_schema, &parsed) {
      Ok(d) => d,
      Err(message) => return StepOutcome::Failed { code: EngineErrorCode::AiResponseInvalid, message, retryable: true },
    };

    let mut hasher = Sha256::new();
    hasher.update(completion.model.as_bytes());
    hasher.update(completion.text.as_bytes());
    let content_hash = format!("{:x}", hasher.finalize());

    delta.insert(format!("ai_model_{}", step.id), ContextValue::String(completion.model));
    delta.insert(format!("ai_content_hash_{}", step.id), ContextValue::String(content_hash));

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

  fn step() -> StepSpec {
    StepSpec { id: "g".into(),
               name: "g".into(),
               description: String::new(),
               kind: StepKind::AiGenerated,
               config: json!({
                 "response_schema": [ { "key": "allocation", "type": "map<string,number>" } ],
                 "allowed_context_keys": [],
                 "sensitive_keys": []
               }),
               dependencies: Default::default(),
               ai_prompt: Some("propose an allocation".into()),
               validation_rules: None }
  }

  #[tokio::test]
  async fn fails_with_ai_response_invalid_when_schema_mismatched() {
    let ai = Arc::new(MockAiProvider::new());
    ai.seed("propose an allocation\n\ncontext: {}", r#"{"allocation":"n/a"}"#, "test-model");
    let ctx = StepContext { snapshot: ContextSnapshot::default(),
                            market_data: Arc::new(MockMarketDataProvider::new()),
                            ai,
                            cancellation: CancellationToken::new() };
    let outcome = AiGeneratedExecutor.execute(&step(), &ctx).await;
    assert!(matches!(outcome, StepOutcome::Failed { code: EngineErrorCode::AiResponseInvalid, retryable: true, .. }));
  }

  #[tokio::test]
  async fn commits_a_valid_response_with_model_and_hash_tags() {
    let ai = Arc::new(MockAiProvider::new());
    ai.seed("propose an allocation\n\ncontext: {}", r#"{"allocation":{"stocks":0.6,"bonds":0.4}}"#, "test-model");
    let ctx = StepContext { snapshot: ContextSnapshot::default(),
                            market_data: Arc::new(MockMarketDataProvider::new()),
                            ai,
                            cancellation: CancellationToken::new() };
    let outcome = AiGeneratedExecutor.execute(&step(), &ctx).await;
    match outcome {
      StepOutcome::Done { delta } => {
        assert!(delta.contains_key("allocation"));
        assert_eq!(delta.get("ai_model_g").and_then(|v| v.as_str()), Some("test-model"));
        assert!(delta.contains_key("ai_content_hash_g"));
      }
      other => panic!("expected Done, got {other:?}"),
    }
  }
}
