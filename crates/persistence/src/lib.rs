//! Diesel-backed durable storage for the workflow engine:
//! `workflow_core::context::ContextStore`,
//! `workflow_core::repository::ExecutionRepository` and
//! `workflow_core::registry::WorkflowRegistry` against the tables in
//! `schema`, dual-compiled against Postgres or SQLite the way the
//! `chem-persistence` crate did.

pub mod diesel_store;
pub mod schema;

pub use diesel_store::{connect, new_from_env, DieselContextStore, DieselExecutionRepository, DieselWorkflowRegistry,
                        MIGRATIONS};
