//! Core domain types, context storage, and workflow registry for the
//! workflow execution engine. Domain-agnostic: nothing here knows about
//! any particular business process, only about steps, dependencies, and
//! versioned context.

pub mod context;
pub mod domain;
pub mod errors;
pub mod registry;
pub mod repository;

pub use context::{ContextStore, InMemoryContextStore};
pub use domain::*;
pub use errors::{EngineError, EngineErrorCode, Result};
pub use registry::{validate_definition, ConfigValidator, InMemoryWorkflowRegistry, WorkflowRegistry};
pub use repository::{is_valid_transition, ExecutionRepository, InMemoryExecutionRepository};
