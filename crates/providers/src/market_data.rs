// Market-data provider boundary: `FetchSeries(symbol, window)`.
// Consumed only by AUTOMATED/DATA_COLLECTION executors.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::rate_limit::ProviderRateLimiter;
use crate::{ProviderError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesPoint {
  pub timestamp: DateTime<Utc>,
  pub value: Decimal,
}

/// Thin boundary over a third-party financial-data API ("an
/// external collaborator ... treated as an opaque provider"). The engine
/// never interprets `symbol`/`window`; it only forwards them.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
  async fn fetch_series(&self, symbol: &str, window: &str) -> Result<Vec<SeriesPoint>>;
}

/// `reqwest`-based client for a JSON market-data endpoint, rate-limited
/// with a `governor` token bucket before every outbound call.
pub struct HttpMarketDataProvider {
  client: reqwest::Client,
  base_url: String,
  limiter: ProviderRateLimiter,
}

impl HttpMarketDataProvider {
  pub fn new(base_url: impl Into<String>, limiter: ProviderRateLimiter) -> Self {
    Self { client: reqwest::Client::new(), base_url: base_url.into(), limiter }
  }

  pub fn new_from_env() -> Self {
    dotenvy::dotenv().ok();
    let base_url = std::env::var("MARKET_DATA_URL").unwrap_or_else(|_| "http://localhost:8090".into());
    Self::new(base_url, ProviderRateLimiter::new("market-data", crate::RateLimitConfig::default()))
  }
}

#[async_trait]
impl MarketDataProvider for HttpMarketDataProvider {
  #[tracing::instrument(skip(self), fields(provider = "market-data"))]
  async fn fetch_series(&self, symbol: &str, window: &str) -> Result<Vec<SeriesPoint>> {
    self.limiter.check()?;
    let url = format!("{}/series/{symbol}", self.base_url);
    let response = self.client
                       .get(&url)
                       .query(&[("window", window)])
                       .timeout(Duration::from_secs(10))
                       .send()
                       .await
                       .map_err(|e| {
                         if e.is_timeout() {
                           ProviderError::Transient(format!("market data request timed out: {e}"))
                         } else {
                           ProviderError::Transient(format!("market data request failed: {e}"))
                         }
                       })?;

    if response.status().is_server_error() {
      tracing::warn!(status = %response.status(), "market data server error");
      return Err(ProviderError::Transient(format!("market data server error: {}", response.status())));
    }
    if !response.status().is_success() {
      return Err(ProviderError::Permanent(format!("market data request rejected: {}", response.status())));
    }

    response.json::<Vec<SeriesPoint>>()
            .await
            .map_err(|e| ProviderError::Permanent(format!("malformed market data response: {e}")))
  }
}

/// Deterministic in-memory provider for tests and the bundled CLI demo
/// ( property 6 requires non-AI executors to be deterministic
/// functions of their inputs; an AUTOMATED step that consumes market data
/// needs a provider whose answers don't vary between test runs).
#[derive(Default)]
pub struct MockMarketDataProvider {
  series: Mutex<HashMap<String, Vec<SeriesPoint>>>,
}

impl MockMarketDataProvider {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn seed(&self, symbol: &str, points: Vec<SeriesPoint>) {
    self.series.lock().expect("mock market data mutex poisoned").insert(symbol.to_string(), points);
  }
}

#[async_trait]
impl MarketDataProvider for MockMarketDataProvider {
  async fn fetch_series(&self, symbol: &str, _window: &str) -> Result<Vec<SeriesPoint>> {
    self.series
        .lock()
        .expect("mock market data mutex poisoned")
        .get(symbol)
        .cloned()
        .ok_or_else(|| ProviderError::Permanent(format!("no seeded series for symbol '{symbol}'")))
  }
}
