// Storage for executions and step executions. Mirrors
// `flow::repository::FlowRepository` / `flow::stubs::InMemoryFlowRepository`
// in shape: a small async trait plus a `Mutex`-guarded in-memory stub used
// by tests and as the default runtime wiring.
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{ExecutionStatus, Page, Pagination, StepExecution, WorkflowExecution};
use crate::errors::{EngineError, Result};

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
  async fn insert_execution(&self, execution: WorkflowExecution) -> Result<()>;
  async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution>;
  async fn update_execution(&self, execution: WorkflowExecution) -> Result<()>;
  async fn list_executions(&self, principal_id: &str, pagination: Pagination) -> Result<Page<WorkflowExecution>>;

  async fn upsert_step_execution(&self, step: StepExecution) -> Result<()>;
  async fn get_step_execution(&self, execution_id: Uuid, step_id: &str) -> Result<Option<StepExecution>>;
  async fn list_step_executions(&self, execution_id: Uuid) -> Result<Vec<StepExecution>>;

  /// Execution ids whose status has been terminal since before `horizon`
  /// ( retention: "executions older than a configured horizon
  /// ... after terminal status are purged").
  async fn list_terminal_before(&self, horizon: DateTime<Utc>) -> Result<Vec<Uuid>>;

  /// Deletes `execution_id`'s execution record and every one of its step
  /// executions. Definitions are never purged this way (/// "Definitions are never purged automatically").
  async fn delete_execution(&self, execution_id: Uuid) -> Result<()>;
}

#[derive(Default)]
struct Tables {
  executions: HashMap<Uuid, WorkflowExecution>,
  steps: HashMap<(Uuid, String), StepExecution>,
}

#[derive(Default)]
pub struct InMemoryExecutionRepository {
  tables: Mutex<Tables>,
}

impl InMemoryExecutionRepository {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
    self.tables
        .lock()
        .map_err(|_| EngineError::Storage("execution repository mutex poisoned".into()))
  }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
  async fn insert_execution(&self, execution: WorkflowExecution) -> Result<()> {
    let mut tables = self.lock()?;
    tables.executions.insert(execution.execution_id, execution);
    Ok(())
  }

  async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution> {
    let tables = self.lock()?;
    tables.executions
          .get(&execution_id)
          .cloned()
          .ok_or_else(|| EngineError::NotFound(format!("execution {execution_id}")))
  }

  async fn update_execution(&self, execution: WorkflowExecution) -> Result<()> {
    let mut tables = self.lock()?;
    let slot = tables.executions
                     .get_mut(&execution.execution_id)
                     .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution.execution_id)))?;
    if slot.status.is_terminal() && slot.status != execution.status {
      return Err(EngineError::TerminalState(format!("execution {} already {:?}", execution.execution_id, slot.status)));
    }
    *slot = execution;
    Ok(())
  }

  async fn list_executions(&self, principal_id: &str, pagination: Pagination) -> Result<Page<WorkflowExecution>> {
    let tables = self.lock()?;
    let mut matches: Vec<WorkflowExecution> =
      tables.executions.values().filter(|e| e.principal_id == principal_id).cloned().collect();
    matches.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    let total = matches.len();
    let start = (pagination.page as usize) * (pagination.page_size as usize);
    let items = matches.into_iter().skip(start).take(pagination.page_size as usize).collect();
    Ok(Page { items, total, page: pagination.page })
  }

  async fn upsert_step_execution(&self, step: StepExecution) -> Result<()> {
    let mut tables = self.lock()?;
    tables.steps.insert((step.execution_id, step.step_id.clone()), step);
    Ok(())
  }

  async fn get_step_execution(&self, execution_id: Uuid, step_id: &str) -> Result<Option<StepExecution>> {
    let tables = self.lock()?;
    Ok(tables.steps.get(&(execution_id, step_id.to_string())).cloned())
  }

  async fn list_step_executions(&self, execution_id: Uuid) -> Result<Vec<StepExecution>> {
    let tables = self.lock()?;
    Ok(tables.steps.values().filter(|s| s.execution_id == execution_id).cloned().collect())
  }

  async fn list_terminal_before(&self, horizon: chrono::DateTime<chrono::Utc>) -> Result<Vec<Uuid>> {
    let tables = self.lock()?;
    Ok(tables.executions
             .values()
             .filter(|e| e.status.is_terminal() && e.completed_at.map(|c| c < horizon).unwrap_or(false))
             .map(|e| e.execution_id)
             .collect())
  }

  async fn delete_execution(&self, execution_id: Uuid) -> Result<()> {
    let mut tables = self.lock()?;
    tables.executions.remove(&execution_id);
    tables.steps.retain(|(eid, _), _| *eid != execution_id);
    Ok(())
  }
}

/// Returns true if `status` can legally replace `from` (
/// property 8: terminal states are write-once).
pub fn is_valid_transition(from: ExecutionStatus, to: ExecutionStatus) -> bool {
  use ExecutionStatus::*;
  if from.is_terminal() {
    return from == to;
  }
  match (from, to) {
    (Pending, Running) => true,
    (Running, Paused) => true,
    (Paused, Running) => true,
    (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
    (Paused, Cancelled) => true,
    (Pending, Cancelled) => true,
    (a, b) if a == b => true,
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use std::collections::BTreeSet;

  fn new_execution(principal: &str) -> WorkflowExecution {
    WorkflowExecution { execution_id: Uuid::new_v4(),
                         workflow_id: "wf".into(),
                         workflow_version: 1,
                         principal_id: principal.into(),
                         session_id: "sess".into(),
                         status: ExecutionStatus::Pending,
                         current_steps: BTreeSet::new(),
                         started_at: Utc::now(),
                         updated_at: Utc::now(),
                         completed_at: None,
                         error: None }
  }

  #[tokio::test]
  async fn terminal_status_rejects_further_mutation() {
    let repo = InMemoryExecutionRepository::new();
    let mut exec = new_execution("alice");
    exec.status = ExecutionStatus::Completed;
    repo.insert_execution(exec.clone()).await.unwrap();

    exec.status = ExecutionStatus::Running;
    let err = repo.update_execution(exec).await.unwrap_err();
    assert!(matches!(err, EngineError::TerminalState(_)));
  }

  #[tokio::test]
  async fn list_executions_filters_by_principal() {
    let repo = InMemoryExecutionRepository::new();
    repo.insert_execution(new_execution("alice")).await.unwrap();
    repo.insert_execution(new_execution("bob")).await.unwrap();

    let page = repo.list_executions("alice", Pagination::default()).await.unwrap();
    assert_eq!(page.total, 1);
  }

  #[tokio::test]
  async fn list_terminal_before_only_returns_executions_past_the_horizon() {
    let repo = InMemoryExecutionRepository::new();
    let mut stale = new_execution("alice");
    stale.status = ExecutionStatus::Completed;
    stale.completed_at = Some(Utc::now() - chrono::Duration::days(100));
    repo.insert_execution(stale.clone()).await.unwrap();

    let mut fresh = new_execution("bob");
    fresh.status = ExecutionStatus::Completed;
    fresh.completed_at = Some(Utc::now());
    repo.insert_execution(fresh.clone()).await.unwrap();

    let horizon = Utc::now() - chrono::Duration::days(90);
    let due = repo.list_terminal_before(horizon).await.unwrap();
    assert_eq!(due, vec![stale.execution_id]);
  }

  #[tokio::test]
  async fn delete_execution_removes_its_step_executions_too() {
    let repo = InMemoryExecutionRepository::new();
    let exec = new_execution("alice");
    repo.insert_execution(exec.clone()).await.unwrap();
    repo.upsert_step_execution(StepExecution { execution_id: exec.execution_id,
                                                step_id: "a".into(),
                                                status: crate::domain::StepStatus::Completed,
                                                attempt: 1,
                                                started_at: None,
                                                finished_at: None,
                                                duration_ms: None,
                                                input_snapshot: serde_json::Value::Null,
                                                output: None,
                                                error: None })
        .await
        .unwrap();

    repo.delete_execution(exec.execution_id).await.unwrap();

    assert!(repo.get_execution(exec.execution_id).await.is_err());
    assert!(repo.list_step_executions(exec.execution_id).await.unwrap().is_empty());
  }

  #[test]
  fn transition_table_blocks_resurrecting_terminal_executions() {
    assert!(is_valid_transition(ExecutionStatus::Pending, ExecutionStatus::Running));
    assert!(!is_valid_transition(ExecutionStatus::Completed, ExecutionStatus::Running));
    assert!(is_valid_transition(ExecutionStatus::Completed, ExecutionStatus::Completed));
  }
}
