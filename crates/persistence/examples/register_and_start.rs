//! Registers a single-step workflow against a local SQLite file and starts
//! one execution, printing the assigned execution id. Run with:
//!
//!     WORKFLOW_DB_URL=workflow.sqlite3 cargo run -p persistence --example register_and_start --no-default-features
use std::collections::BTreeSet;

use persistence::new_from_env;
use uuid::Uuid;
use workflow_core::domain::{ExecutionStatus, StepKind, StepSpec, WorkflowDefinitionInput, WorkflowExecution};
use workflow_core::registry::WorkflowRegistry;
use workflow_core::repository::ExecutionRepository;

#[tokio::main]
async fn main() {
  let (_context_store, execution_repo, registry) = new_from_env().expect("connect to WORKFLOW_DB_URL/DATABASE_URL");

  let input = WorkflowDefinitionInput { id: "hello-workflow".into(),
                                         name: "Hello workflow".into(),
                                         description: "single automated step".into(),
                                         category: "demo".into(),
                                         steps: vec![StepSpec { id: "noop".into(),
                                                                 name: "noop".into(),
                                                                 description: String::new(),
                                                                 kind: StepKind::Automated,
                                                                 config: serde_json::json!({
                                                                   "transform": "passthrough",
                                                                   "input_key": "raw_value",
                                                                   "output_key": "value"
                                                                 }),
                                                                 dependencies: BTreeSet::new(),
                                                                 ai_prompt: None,
                                                                 validation_rules: None }],
                                         entry_points: BTreeSet::from(["noop".to_string()]),
                                         exit_points: BTreeSet::from(["noop".to_string()]),
                                         ai_configurable: false };
  let definition = registry.register(input).await.expect("register workflow");
  println!("registered {} v{}", definition.id, definition.version);

  let execution_id = Uuid::new_v4();
  execution_repo.insert_execution(WorkflowExecution { execution_id,
                                                       workflow_id: definition.id,
                                                       workflow_version: definition.version,
                                                       principal_id: "demo-user".into(),
                                                       session_id: Uuid::new_v4().to_string(),
                                                       status: ExecutionStatus::Pending,
                                                       current_steps: BTreeSet::new(),
                                                       started_at: chrono::Utc::now(),
                                                       updated_at: chrono::Utc::now(),
                                                       completed_at: None,
                                                       error: None })
               .await
               .expect("insert execution");
  println!("started execution {execution_id}");
}
