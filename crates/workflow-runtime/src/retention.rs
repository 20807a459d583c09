// Retention sweep: executions older than a configured horizon (default
// 90 days after terminal status) are purged along with their step
// executions and context commits. Definitions are never purged
// automatically. No prior analogue — nothing upstream ran executions
// long enough to need one; grounded on the delete-then-purge pairing
// `workflow_core::repository::ExecutionRepository::delete_execution` and
// `workflow_core::context::ContextStore::purge` expose for exactly this
// call site.
use std::time::Duration;

use chrono::Utc;

use workflow_core::Result;

use crate::engine::Engine;

/// Default retention horizon: 90 days after an execution's terminal status
///.
pub const DEFAULT_RETENTION_HORIZON: Duration = Duration::from_secs(90 * 24 * 60 * 60);

impl Engine {
  /// Deletes every execution (and its step executions and context commits)
  /// whose terminal status is older than `horizon`. Returns the number of
  /// executions purged. Definitions are untouched.
  pub async fn purge_expired_executions(&self, horizon: Duration) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::from_std(horizon).unwrap_or(chrono::Duration::zero());
    let due = self.executions().list_terminal_before(cutoff).await?;
    for execution_id in &due {
      self.context_store().purge(*execution_id).await?;
      self.executions().delete_execution(*execution_id).await?;
    }
    Ok(due.len())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use chrono::Duration as ChronoDuration;
  use indexmap::IndexMap;
  use providers::{MockAiProvider, MockMarketDataProvider};
  use step_library::StepLibrary;
  use workflow_core::{
    ExecutionStatus, InMemoryContextStore, InMemoryExecutionRepository, InMemoryWorkflowRegistry, WorkflowExecution,
  };

  use super::*;
  use crate::EngineOptions;

  fn engine() -> Engine {
    let library = Arc::new(StepLibrary::new());
    Engine::new(Arc::new(InMemoryWorkflowRegistry::new().with_config_validator(library.config_validator())),
                Arc::new(InMemoryContextStore::new()),
                Arc::new(InMemoryExecutionRepository::new()),
                library,
                Arc::new(MockMarketDataProvider::new()),
                Arc::new(MockAiProvider::new()),
                EngineOptions::default())
  }

  #[tokio::test]
  async fn purge_removes_only_executions_past_the_horizon() {
    let engine = engine();
    let now = Utc::now();

    let stale_id = uuid::Uuid::new_v4();
    let stale = WorkflowExecution { execution_id: stale_id,
                                     workflow_id: "wf".into(),
                                     workflow_version: 1,
                                     principal_id: "alice".into(),
                                     session_id: "sess".into(),
                                     status: ExecutionStatus::Completed,
                                     current_steps: Default::default(),
                                     started_at: now - ChronoDuration::days(100),
                                     updated_at: now - ChronoDuration::days(100),
                                     completed_at: Some(now - ChronoDuration::days(100)),
                                     error: None };
    engine.executions().insert_execution(stale).await.unwrap();
    engine.context_store().commit(stale_id, "a", IndexMap::new(), 0).await.unwrap();

    let fresh_id = uuid::Uuid::new_v4();
    let mut fresh = engine.executions().get_execution(stale_id).await.unwrap();
    fresh.execution_id = fresh_id;
    fresh.completed_at = Some(now);
    engine.executions().insert_execution(fresh).await.unwrap();

    let purged = engine.purge_expired_executions(DEFAULT_RETENTION_HORIZON).await.unwrap();
    assert_eq!(purged, 1);

    assert!(engine.get_execution(stale_id).await.is_err());
    assert!(engine.context_store().history(stale_id).await.unwrap().is_empty());
    assert!(engine.get_execution(fresh_id).await.is_ok());
  }
}
