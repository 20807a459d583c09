// Token-bucket rate limiting in front of outbound provider calls.
// Grounded on the `RateLimiter` wrapper in the pack's
// `knhk-workflow-engine` example (`resilience::rate_limit`), which wraps
// `governor::RateLimiter` the same way: a named, non-keyed direct limiter
// with a `check`/`wait` pair.
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorRateLimiter};

use crate::{ProviderError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
  pub max_requests: u32,
  pub window: Duration,
  pub burst: Option<u32>,
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self { max_requests: 60, window: Duration::from_secs(60), burst: None }
  }
}

/// Named token bucket guarding one external provider ("the
/// engine requests capacity from a token bucket before any outbound call").
/// Exhaustion maps to `ProviderError::RateLimited`, which the step
/// executors turn into `Failed(RateLimited, retryable=true)`.
pub struct ProviderRateLimiter {
  name: String,
  limiter: Arc<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl ProviderRateLimiter {
  pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
    let burst = config.burst.unwrap_or(config.max_requests).max(1);
    let burst = NonZeroU32::new(burst).expect("burst clamped to >= 1 above");
    let quota = Quota::with_period(config.window).expect("window must be non-zero").allow_burst(burst);
    Self { name: name.into(), limiter: Arc::new(GovernorRateLimiter::direct(quota)) }
  }

  /// Non-blocking admission check. Returns `RateLimited` immediately when
  /// the bucket is empty; callers combine this with the engine's own retry
  /// policy rather than blocking here.
  pub fn check(&self) -> Result<()> {
    self.limiter
        .check()
        .map_err(|_| ProviderError::RateLimited(format!("rate limit exceeded for provider '{}'", self.name)))
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn admits_requests_up_to_the_burst_then_rejects() {
    let limiter =
      ProviderRateLimiter::new("test", RateLimitConfig { max_requests: 3, window: Duration::from_secs(60), burst: None });
    for _ in 0..3 {
      limiter.check().expect("within burst");
    }
    assert!(matches!(limiter.check(), Err(ProviderError::RateLimited(_))));
  }
}
