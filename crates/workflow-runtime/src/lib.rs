//! Execution State Machine and Scheduler: drives a registered
//! `WorkflowDefinition` from `PENDING` through to a terminal status,
//! dispatching every ready step through the step library and persisting
//! each transition before acknowledging it.
//!
//! Generalizes `ChemicalFlowEngine`: where it tracks one `current_step`
//! cursor through a macro-generated linear sequence, `Engine` tracks a
//! set of concurrently ready steps over a DAG and dispatches
//! write-key-disjoint steps together via a `tokio::task::JoinSet`,
//! keeping the same persist-before-advance ordering
//! (`persist_step_result` then `update_engine_state_after_persist`) but
//! generalized from "exactly one step in flight" to "every ready step
//! whose output doesn't collide with another's".

pub mod engine;
pub mod retention;
pub mod retry;
pub mod scheduler;

pub use engine::{Engine, EngineEvent, EngineEventKind, EngineOptions};
pub use retention::DEFAULT_RETENTION_HORIZON;
pub use retry::RetryPolicy;
