// AI completion provider boundary ( `Complete(prompt, schema)`).
// The engine treats this as a thin boundary over a chat-completion
// endpoint ( non-goal: "no AI model training"); schema
// validation and content-hash dedup are the AI_GENERATED executor's job
// (step-library), not the provider's.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::rate_limit::ProviderRateLimiter;
use crate::{ProviderError, Result};

/// Raw provider response before schema validation. `model` is the
/// provider-reported model identifier the AI_GENERATED executor tags onto
/// its commit ( "Determinism": "AI executor must tag its
/// commit with a provider model identifier and a content hash").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiCompletion {
  pub text: String,
  pub model: String,
}

#[async_trait]
pub trait AiProvider: Send + Sync {
  async fn complete(&self, prompt: &str, schema: &JsonValue) -> Result<AiCompletion>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
  prompt: &'a str,
  response_schema: &'a JsonValue,
}

#[derive(Deserialize)]
struct CompletionResponse {
  text: String,
  model: String,
}

/// `reqwest`-based client for a JSON chat-completion endpoint.
pub struct HttpAiProvider {
  client: reqwest::Client,
  base_url: String,
  limiter: ProviderRateLimiter,
}

impl HttpAiProvider {
  pub fn new(base_url: impl Into<String>, limiter: ProviderRateLimiter) -> Self {
    Self { client: reqwest::Client::new(), base_url: base_url.into(), limiter }
  }

  pub fn new_from_env() -> Self {
    dotenvy::dotenv().ok();
    let base_url = std::env::var("AI_COMPLETION_URL").unwrap_or_else(|_| "http://localhost:8091".into());
    Self::new(base_url, ProviderRateLimiter::new("ai-completion", crate::RateLimitConfig::default()))
  }
}

#[async_trait]
impl AiProvider for HttpAiProvider {
  #[tracing::instrument(skip(self, prompt, schema), fields(provider = "ai-completion", prompt_len = prompt.len()))]
  async fn complete(&self, prompt: &str, schema: &JsonValue) -> Result<AiCompletion> {
    self.limiter.check()?;
    let url = format!("{}/v1/complete", self.base_url);
    let response = self.client
                       .post(&url)
                       .json(&CompletionRequest { prompt, response_schema: schema })
                       .timeout(Duration::from_secs(30))
                       .send()
                       .await
                       .map_err(|e| {
                         if e.is_timeout() {
                           ProviderError::Transient(format!("AI completion request timed out: {e}"))
                         } else {
                           ProviderError::Transient(format!("AI completion request failed: {e}"))
                         }
                       })?;

    if response.status().is_server_error() {
      tracing::warn!(status = %response.status(), "AI completion server error");
      return Err(ProviderError::Transient(format!("AI completion server error: {}", response.status())));
    }
    if !response.status().is_success() {
      return Err(ProviderError::Permanent(format!("AI completion request rejected: {}", response.status())));
    }

    let parsed = response.json::<CompletionResponse>()
                         .await
                         .map_err(|e| ProviderError::Permanent(format!("malformed AI completion response: {e}")))?;
    tracing::debug!(model = %parsed.model, "AI completion received");
    Ok(AiCompletion { text: parsed.text, model: parsed.model })
  }
}

/// Deterministic mock keyed by prompt text, for tests and the bundled CLI
/// demo. Returns a fixed canned response per prompt so AI_GENERATED steps
/// can be exercised without a network endpoint.
#[derive(Default)]
pub struct MockAiProvider {
  canned: Mutex<HashMap<String, AiCompletion>>,
}

impl MockAiProvider {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn seed(&self, prompt: &str, text: &str, model: &str) {
    self.canned
        .lock()
        .expect("mock AI provider mutex poisoned")
        .insert(prompt.to_string(), AiCompletion { text: text.to_string(), model: model.to_string() });
  }
}

#[async_trait]
impl AiProvider for MockAiProvider {
  async fn complete(&self, prompt: &str, _schema: &JsonValue) -> Result<AiCompletion> {
    self.canned
        .lock()
        .expect("mock AI provider mutex poisoned")
        .get(prompt)
        .cloned()
        .ok_or_else(|| ProviderError::Permanent(format!("no canned response for prompt '{prompt}'")))
  }
}
