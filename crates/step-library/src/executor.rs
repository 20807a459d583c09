// Object-safe executor dispatch: a strongly-typed trait would be
// natural per step kind, but the engine needs to hold a single
// `HashMap<StepKind, Arc<dyn Executor>>` and call through it without
// knowing the concrete type, so `Executor` itself is already object-safe
// and there is no separate typed/dyn pair here.
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use workflow_core::{ContextSnapshot, ContextValue, EngineError, Result, StepSpec};

use providers::{AiProvider, MarketDataProvider};

/// Fixed-precision arithmetic constants shared by every built-in executor:
/// weights carry 10 fractional digits, currency amounts 4, and equality
/// comparisons tolerate 1e-6 of drift.
pub const WEIGHT_SCALE: u32 = 10;
pub const CURRENCY_SCALE: u32 = 4;

use once_cell::sync::Lazy;
use rust_decimal::Decimal;
pub static TOLERANCE: Lazy<Decimal> = Lazy::new(|| Decimal::new(1, 6));

/// Everything an executor needs besides the step's own spec and config:
/// a read-only snapshot of the context and handles to the provider layer.
/// Grounded on `chem-workflow::step::StepContext`, generalized from a
/// chemistry-specific `DomainRepository` handle to the market-data and
/// AI-completion provider traits.
pub struct StepContext {
  pub snapshot: ContextSnapshot,
  pub market_data: Arc<dyn MarketDataProvider>,
  pub ai: Arc<dyn AiProvider>,
  pub cancellation: CancellationToken,
}

impl StepContext {
  pub fn get(&self, key: &str) -> Option<&ContextValue> {
    self.snapshot.data.get(key)
  }
}

/// What an executor's single call produces.
#[derive(Debug, Clone)]
pub enum StepOutcome {
  /// Step completed; `delta` is merged into the context atomically.
  Done { delta: IndexMap<String, ContextValue> },
  /// Step needs externally supplied input before it can proceed
  /// (USER_INTERACTION, DECISION, or DATA_COLLECTION awaiting its fields).
  AwaitInput { prompt: String, expected_keys: Vec<String> },
  /// Step failed; `retryable` governs whether the scheduler's retry
  /// policy may re-invoke it.
  Failed { code: workflow_core::EngineErrorCode, message: String, retryable: bool },
  /// Step declined to run (e.g. a conditional rule); the scheduler treats
  /// it as terminal without committing a delta.
  Skipped { reason: String },
}

/// Dispatch target for one `StepKind`. Implementations must be
/// deterministic functions of `(step, ctx)` for every kind except
/// AI_GENERATED.
#[async_trait]
pub trait Executor: Send + Sync {
  /// Validates `config` against this kind's schema, called by
  /// `WorkflowRegistry::register` (via `StepLibrary`) at definition
  /// registration time, before any step ever dispatches.
  fn validate_config(&self, config: &serde_json::Value) -> Result<()> {
    let _ = config;
    Ok(())
  }

  async fn execute(&self, step: &StepSpec, ctx: &StepContext) -> StepOutcome;

  /// Declared output keys this step's commit will write, used by the
  /// scheduler to serialize steps whose outputs would otherwise race.
  /// Best-effort: a step
  /// whose config can't be parsed yet contributes no keys and is simply
  /// never considered to conflict with anything.
  fn output_keys(&self, step: &StepSpec) -> Vec<String> {
    let _ = step;
    Vec::new()
  }

  /// Resumes a step previously left `AwaitInput`, folding in caller-supplied
  /// values via `ProvideStepInput`. Executors that never await
  /// input (AUTOMATED, AI_GENERATED) can use the default, which rejects
  /// any call as a programming error on the caller's part.
  async fn provide_input(&self,
                          step: &StepSpec,
                          ctx: &StepContext,
                          _input: IndexMap<String, ContextValue>)
                          -> StepOutcome {
    let _ = (step, ctx);
    StepOutcome::Failed { code: workflow_core::EngineErrorCode::ValidationFailed,
                           message: "this step kind does not accept external input".into(),
                           retryable: false }
  }
}

pub(crate) fn failed(err: EngineError) -> StepOutcome {
  StepOutcome::Failed { code: err.code(), message: err.to_string(), retryable: err.retryable() }
}

pub(crate) type ExecResult = Result<IndexMap<String, ContextValue>>;
