// Domain errors for the workflow engine and the stable wire codes that
// accompany them as `ErrorEnvelope.code` on the wire.
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("cyclic dependencies: {0}")]
  CyclicDependencies(String),

  #[error("unreachable step: {0}")]
  UnreachableStep(String),

  #[error("duplicate step id: {0}")]
  DuplicateStepId(String),

  #[error("invalid entry/exit points: {0}")]
  InvalidEntryExit(String),

  #[error("unknown step kind: {0}")]
  UnknownStepKind(String),

  #[error("incompatible step config: {0}")]
  IncompatibleStepConfig(String),

  #[error("version conflict: {0}")]
  VersionConflict(String),

  #[error("validation failed: {0}")]
  ValidationFailed(String),

  #[error("AI response invalid: {0}")]
  AiResponseInvalid(String),

  #[error("rate limited: {0}")]
  RateLimited(String),

  #[error("timeout: {0}")]
  Timeout(String),

  #[error("transient error: {0}")]
  Transient(String),

  #[error("execution is in a terminal state: {0}")]
  TerminalState(String),

  #[error("cancellation not honoured in time: {0}")]
  CancellationTimedOut(String),

  #[error("storage error: {0}")]
  Storage(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("internal error: {0}")]
  Internal(String),
}

impl EngineError {
  /// Stable wire identifier, matches the wire `ErrorEnvelope.code`.
  pub fn code(&self) -> EngineErrorCode {
    match self {
      EngineError::NotFound(_) => EngineErrorCode::NotFound,
      EngineError::CyclicDependencies(_) => EngineErrorCode::CyclicDependencies,
      EngineError::UnreachableStep(_) => EngineErrorCode::UnreachableStep,
      EngineError::DuplicateStepId(_) => EngineErrorCode::DuplicateStepId,
      EngineError::InvalidEntryExit(_) => EngineErrorCode::InvalidEntryExit,
      EngineError::UnknownStepKind(_) => EngineErrorCode::UnknownStepKind,
      EngineError::IncompatibleStepConfig(_) => EngineErrorCode::IncompatibleStepConfig,
      EngineError::VersionConflict(_) => EngineErrorCode::VersionConflict,
      EngineError::ValidationFailed(_) => EngineErrorCode::ValidationFailed,
      EngineError::AiResponseInvalid(_) => EngineErrorCode::AiResponseInvalid,
      EngineError::RateLimited(_) => EngineErrorCode::RateLimited,
      EngineError::Timeout(_) => EngineErrorCode::Timeout,
      EngineError::Transient(_) => EngineErrorCode::Transient,
      EngineError::TerminalState(_) => EngineErrorCode::TerminalState,
      EngineError::CancellationTimedOut(_) => EngineErrorCode::CancellationTimedOut,
      EngineError::Storage(_) => EngineErrorCode::Internal,
      EngineError::Serialization(_) => EngineErrorCode::Internal,
      EngineError::Internal(_) => EngineErrorCode::Internal,
    }
  }

  /// Whether the engine's retry policy may absorb this error.
  pub fn retryable(&self) -> bool {
    matches!(self,
             EngineError::VersionConflict(_)
             | EngineError::RateLimited(_)
             | EngineError::Timeout(_)
             | EngineError::Transient(_))
  }

  /// Reconstructs an error from a wire `EngineErrorCode` and message, for
  /// call sites that only have a `StepOutcome::Failed`'s code/message pair
  /// (e.g. reporting a rejected `ProvideStepInput` back to its caller).
  pub fn from_code(code: EngineErrorCode, message: String) -> Self {
    match code {
      EngineErrorCode::NotFound => EngineError::NotFound(message),
      EngineErrorCode::CyclicDependencies => EngineError::CyclicDependencies(message),
      EngineErrorCode::UnreachableStep => EngineError::UnreachableStep(message),
      EngineErrorCode::DuplicateStepId => EngineError::DuplicateStepId(message),
      EngineErrorCode::InvalidEntryExit => EngineError::InvalidEntryExit(message),
      EngineErrorCode::UnknownStepKind => EngineError::UnknownStepKind(message),
      EngineErrorCode::IncompatibleStepConfig => EngineError::IncompatibleStepConfig(message),
      EngineErrorCode::VersionConflict => EngineError::VersionConflict(message),
      EngineErrorCode::ValidationFailed => EngineError::ValidationFailed(message),
      EngineErrorCode::AiResponseInvalid => EngineError::AiResponseInvalid(message),
      EngineErrorCode::RateLimited => EngineError::RateLimited(message),
      EngineErrorCode::Timeout => EngineError::Timeout(message),
      EngineErrorCode::Transient => EngineError::Transient(message),
      EngineErrorCode::TerminalState => EngineError::TerminalState(message),
      EngineErrorCode::CancellationTimedOut => EngineError::CancellationTimedOut(message),
      EngineErrorCode::Internal => EngineError::Internal(message),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineErrorCode {
  NotFound,
  CyclicDependencies,
  UnreachableStep,
  DuplicateStepId,
  InvalidEntryExit,
  UnknownStepKind,
  IncompatibleStepConfig,
  VersionConflict,
  ValidationFailed,
  AiResponseInvalid,
  RateLimited,
  Timeout,
  Transient,
  TerminalState,
  CancellationTimedOut,
  Internal,
}

pub type Result<T> = std::result::Result<T, EngineError>;
