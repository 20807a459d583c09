// Exponential backoff with jitter for retryable step failures: a
// retryable failure is retried up to `max_attempts` times before the
// step is recorded FAILED. Steps in the engine this generalizes from
// never retry, so there is no direct analogue; grounded on the wider
// pack's `knhk-workflow-engine::resilience` module, the same source
// `providers::rate_limit` draws its token-bucket pattern from.
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self { max_attempts: 3, base_delay: Duration::from_millis(500), max_delay: Duration::from_secs(30) }
  }
}

/// The overridable fields of `StepSpec.config.retry` ("drawn from
/// `StepSpec.config.retry` with defaults ..."). Any field the step omits
/// falls back to the engine-wide policy rather than the built-in default
/// directly, so an `EngineOptions` override still applies to steps that
/// don't declare their own `retry` block.
#[derive(Debug, Default, serde::Deserialize)]
struct RetryConfig {
  max_attempts: Option<u32>,
  base_delay_ms: Option<u64>,
  max_delay_ms: Option<u64>,
}

impl RetryPolicy {
  /// Resolves a step's effective retry policy: `step_config.retry`
  /// overrides `default` field by field, falling back to `default`
  /// entirely when absent or malformed.
  pub fn from_step_config(step_config: &serde_json::Value, default: RetryPolicy) -> RetryPolicy {
    let Some(retry) = step_config.get("retry") else { return default };
    let Ok(overrides) = serde_json::from_value::<RetryConfig>(retry.clone()) else { return default };
    RetryPolicy { max_attempts: overrides.max_attempts.unwrap_or(default.max_attempts),
                  base_delay: overrides.base_delay_ms.map(Duration::from_millis).unwrap_or(default.base_delay),
                  max_delay: overrides.max_delay_ms.map(Duration::from_millis).unwrap_or(default.max_delay) }
  }

  /// `attempt` is 1-indexed: the first execution. Returns true once no
  /// further retry is permitted.
  pub fn exhausted(&self, attempt: u32) -> bool {
    attempt >= self.max_attempts
  }

  /// Delay before retrying after `attempt`, doubling each time and capped
  /// at `max_delay`, with ±20% jitter so concurrently failing steps don't
  /// retry in lockstep.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    let exp = self.base_delay.saturating_mul(1u32 << exponent);
    let jitter_fraction: f64 = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered = exp.mul_f64((1.0 + jitter_fraction).max(0.0));
    jittered.min(self.max_delay)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn attempts_up_to_max_are_not_exhausted() {
    let policy = RetryPolicy { max_attempts: 3, ..RetryPolicy::default() };
    assert!(!policy.exhausted(1));
    assert!(!policy.exhausted(2));
    assert!(policy.exhausted(3));
  }

  #[test]
  fn delay_grows_and_caps_at_max_delay() {
    let policy = RetryPolicy { base_delay: Duration::from_millis(100), max_delay: Duration::from_secs(1), ..RetryPolicy::default() };
    assert!(policy.delay_for(1) < policy.delay_for(4));
    assert!(policy.delay_for(20) <= Duration::from_secs(1));
  }

  #[test]
  fn step_config_overrides_apply_field_by_field() {
    let default = RetryPolicy::default();
    let step_config = serde_json::json!({ "retry": { "max_attempts": 5 } });
    let resolved = RetryPolicy::from_step_config(&step_config, default);
    assert_eq!(resolved.max_attempts, 5);
    assert_eq!(resolved.base_delay, default.base_delay);
    assert_eq!(resolved.max_delay, default.max_delay);
  }

  #[test]
  fn missing_or_malformed_retry_block_falls_back_to_the_default() {
    let default = RetryPolicy::default();
    assert_eq!(RetryPolicy::from_step_config(&serde_json::json!({}), default).max_attempts, default.max_attempts);
    let malformed = serde_json::json!({ "retry": { "max_attempts": "five" } });
    assert_eq!(RetryPolicy::from_step_config(&malformed, default).max_attempts, default.max_attempts);
  }
}
