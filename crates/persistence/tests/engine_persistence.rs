//! Exercises the Diesel-backed stores end to end against an in-memory
//! SQLite database: register a workflow, start an execution, commit
//! context and record a step execution, then read everything back through
//! a second connection from the same pool.
use std::collections::BTreeSet;

use indexmap::IndexMap;
use persistence::connect;
use uuid::Uuid;
use workflow_core::context::ContextStore;
use workflow_core::domain::{ContextValue, ErrorInfo, EngineErrorCode, ExecutionStatus, Pagination, StepExecution,
                             StepKind, StepSpec, StepStatus, WorkflowDefinitionInput, WorkflowExecution};
use workflow_core::registry::WorkflowRegistry;
use workflow_core::repository::ExecutionRepository;

fn memory_url() -> String {
  format!("file:memdb_{}?mode=memory&cache=shared", Uuid::new_v4())
}

fn step(id: &str, deps: &[&str]) -> StepSpec {
  StepSpec { id: id.into(),
             name: id.into(),
             description: String::new(),
             kind: StepKind::Automated,
             config: serde_json::Value::Null,
             dependencies: deps.iter().map(|s| s.to_string()).collect(),
             ai_prompt: None,
             validation_rules: None }
}

#[tokio::test]
async fn registers_a_workflow_and_drives_one_execution_to_completion() {
  let (context_store, execution_repo, registry) = connect(&memory_url()).expect("connect");

  let input = WorkflowDefinitionInput { id: "portfolio-setup".into(),
                                         name: "Portfolio setup".into(),
                                         description: String::new(),
                                         category: "onboarding".into(),
                                         steps: vec![step("collect_profile", &[])],
                                         entry_points: BTreeSet::from(["collect_profile".to_string()]),
                                         exit_points: BTreeSet::from(["collect_profile".to_string()]),
                                         ai_configurable: false };
  let definition = registry.register(input).await.expect("register");
  assert_eq!(definition.version, 1);

  let execution_id = Uuid::new_v4();
  let execution = WorkflowExecution { execution_id,
                                       workflow_id: definition.id.clone(),
                                       workflow_version: definition.version,
                                       principal_id: "alice".into(),
                                       session_id: "sess-1".into(),
                                       status: ExecutionStatus::Running,
                                       current_steps: BTreeSet::from(["collect_profile".to_string()]),
                                       started_at: chrono::Utc::now(),
                                       updated_at: chrono::Utc::now(),
                                       completed_at: None,
                                       error: None };
  execution_repo.insert_execution(execution.clone()).await.expect("insert execution");

  let mut delta = IndexMap::new();
  delta.insert("risk_tolerance".to_string(), ContextValue::String("moderate".into()));
  let result = context_store.commit(execution_id, "collect_profile", delta, 0).await.expect("commit");
  assert_eq!(result, workflow_core::domain::PersistResult::Ok { new_version: 1 });

  execution_repo.upsert_step_execution(StepExecution { execution_id,
                                                        step_id: "collect_profile".into(),
                                                        status: StepStatus::Completed,
                                                        attempt: 1,
                                                        started_at: Some(chrono::Utc::now()),
                                                        finished_at: Some(chrono::Utc::now()),
                                                        duration_ms: Some(12),
                                                        input_snapshot: serde_json::json!({}),
                                                        output: Some(serde_json::json!({"ok": true})),
                                                        error: None })
               .await
               .expect("upsert step");

  let mut completed = execution;
  completed.status = ExecutionStatus::Completed;
  completed.completed_at = Some(chrono::Utc::now());
  execution_repo.update_execution(completed).await.expect("complete execution");

  let fetched = execution_repo.get_execution(execution_id).await.expect("get execution");
  assert_eq!(fetched.status, ExecutionStatus::Completed);

  let snapshot = context_store.snapshot(execution_id).await.expect("snapshot");
  assert_eq!(snapshot.data.get("risk_tolerance"), Some(&ContextValue::String("moderate".into())));

  let steps = execution_repo.list_step_executions(execution_id).await.expect("list steps");
  assert_eq!(steps.len(), 1);
  assert_eq!(steps[0].status, StepStatus::Completed);

  let page = execution_repo.list_executions("alice", Pagination::default()).await.expect("list executions");
  assert_eq!(page.total, 1);

  // a terminal execution is write-once.
  let mut reopen = fetched;
  reopen.status = ExecutionStatus::Running;
  reopen.error = Some(ErrorInfo { code: EngineErrorCode::Internal, message: "nope".into(), retryable: false, details: None });
  let err = execution_repo.update_execution(reopen).await.unwrap_err();
  assert!(matches!(err, workflow_core::errors::EngineError::TerminalState(_)));
}
