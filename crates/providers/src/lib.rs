//! External provider boundary: market-data, AI-completion, and
//! the token-bucket rate limiting the engine requests capacity from
//! before any outbound call. Replaces the chemistry-specific
//! `chem-providers` (pyo3-backed RDKit bridge), which has no role once
//! the chemistry domain is dropped; `reqwest` is the idiomatic "thin
//! boundary over an HTTP endpoint" choice used pack-wide for this role.

mod ai;
mod market_data;
mod rate_limit;

pub use ai::{AiProvider, HttpAiProvider, MockAiProvider};
pub use market_data::{HttpMarketDataProvider, MarketDataProvider, MockMarketDataProvider, SeriesPoint};
pub use rate_limit::{ProviderRateLimiter, RateLimitConfig};

use thiserror::Error;

/// Errors a provider call can raise ( `RateLimited`/`Timeout`/
/// `Transient` plus a permanent variant for non-retryable failures).
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
  #[error("rate limited: {0}")]
  RateLimited(String),
  #[error("transient provider error: {0}")]
  Transient(String),
  #[error("permanent provider error: {0}")]
  Permanent(String),
}

impl ProviderError {
  pub fn retryable(&self) -> bool {
    matches!(self, ProviderError::RateLimited(_) | ProviderError::Transient(_))
  }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
