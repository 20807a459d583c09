//! Boundary Layer: a transport-agnostic async trait
//! over the engine's RPC verbs, plus the wire DTOs those verbs exchange.
//! No network transport lives here — this crate ships a CLI, not a
//! server, so `EngineBoundary` is the seam a future HTTP/gRPC adapter (or
//! the CLI in `src/main.rs`) is built against, the same "trait first,
//! transport later" shape `providers::MarketDataProvider`/`AiProvider`
//! already use for their own external boundary.

pub mod wire;

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use uuid::Uuid;

use workflow_core::{EngineErrorCode, Pagination, WorkflowExecution};
use workflow_runtime::{Engine, EngineEventKind};

use wire::{
  ErrorEnvelope, ExecutionStatusView, ProvideStepInputRequest, StartExecutionRequest, StartExecutionResponse,
  StepStatusEntry, StreamEvent, WorkflowDefinition, WorkflowDefinitionInput, WorkflowSummary,
};

pub type BoundaryResult<T> = Result<T, ErrorEnvelope>;
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// The RPC verbs of the boundary layer, decoupled from any transport.
#[async_trait]
pub trait EngineBoundary: Send + Sync {
  async fn register_workflow(&self, def: WorkflowDefinitionInput) -> BoundaryResult<(String, i64)>;
  async fn get_workflow(&self, id: &str, version: Option<i64>) -> BoundaryResult<WorkflowDefinition>;
  async fn list_workflows(&self, category: Option<&str>, page: Pagination) -> BoundaryResult<workflow_core::Page<WorkflowSummary>>;
  async fn start_execution(&self, req: StartExecutionRequest) -> BoundaryResult<StartExecutionResponse>;
  async fn get_execution(&self, execution_id: Uuid) -> BoundaryResult<ExecutionStatusView>;
  /// Restartable from `from_version`: commits already at or below that
  /// version are skipped, so a reconnecting client's replay is idempotent
  /// ( "cursors are idempotent").
  fn stream_execution(&self, execution_id: Uuid, from_version: i64) -> EventStream;
  async fn provide_step_input(&self, req: ProvideStepInputRequest) -> BoundaryResult<()>;
  async fn pause(&self, execution_id: Uuid) -> BoundaryResult<()>;
  async fn resume(&self, execution_id: Uuid) -> BoundaryResult<()>;
  async fn cancel(&self, execution_id: Uuid) -> BoundaryResult<()>;
  async fn list_executions(&self, principal_id: &str, page: Pagination) -> BoundaryResult<workflow_core::Page<WorkflowExecution>>;
}

/// Thin adapter from `EngineBoundary` onto a live `workflow_runtime::Engine`.
pub struct EngineGateway {
  engine: Engine,
}

impl EngineGateway {
  pub fn new(engine: Engine) -> Self {
    Self { engine }
  }

  async fn status_view(&self, execution_id: Uuid) -> BoundaryResult<ExecutionStatusView> {
    let execution = self.engine.get_execution(execution_id).await.map_err(ErrorEnvelope::from)?;
    let steps = self.engine.list_step_executions(execution_id).await.map_err(ErrorEnvelope::from)?;
    let version = self.engine
                      .context_store()
                      .snapshot(execution_id)
                      .await
                      .map_err(ErrorEnvelope::from)?
                      .version;
    Ok(ExecutionStatusView { execution_id: execution.execution_id,
                              workflow_id: execution.workflow_id,
                              workflow_version: execution.workflow_version,
                              status: execution.status,
                              current_steps: steps.into_iter()
                                                   .map(|s| StepStatusEntry { step_id: s.step_id, status: s.status })
                                                   .collect(),
                              version,
                              started_at: execution.started_at,
                              updated_at: execution.updated_at,
                              completed_at: execution.completed_at,
                              error: execution.error.map(ErrorEnvelope::from) })
  }
}

#[async_trait]
impl EngineBoundary for EngineGateway {
  async fn register_workflow(&self, def: WorkflowDefinitionInput) -> BoundaryResult<(String, i64)> {
    let def = self.engine.register_workflow(def).await.map_err(ErrorEnvelope::from)?;
    Ok((def.id, def.version))
  }

  async fn get_workflow(&self, id: &str, version: Option<i64>) -> BoundaryResult<WorkflowDefinition> {
    self.engine.get_workflow(id, version).await.map_err(ErrorEnvelope::from)
  }

  async fn list_workflows(&self,
                           category: Option<&str>,
                           page: Pagination)
                           -> BoundaryResult<workflow_core::Page<WorkflowSummary>> {
    let mut items = self.engine.list_workflows(category).await.map_err(ErrorEnvelope::from)?;
    let total = items.len();
    let start = (page.page as usize) * (page.page_size as usize);
    items = items.into_iter().skip(start).take(page.page_size as usize).collect();
    Ok(workflow_core::Page { items, total, page: page.page })
  }

  async fn start_execution(&self, req: StartExecutionRequest) -> BoundaryResult<StartExecutionResponse> {
    // Per-request `options` (max_parallelism, step_deadlines) are accepted
    // on the wire for forward compatibility but not yet honoured: this
    // `Engine` applies one fixed `EngineOptions` set at construction,
    // shared by every execution it drives. See DESIGN.md.
    let execution_id = self.engine
                           .start_execution(&req.workflow_id,
                                             req.version,
                                             req.initial_context.data,
                                             req.principal_id,
                                             req.session_id)
                           .await
                           .map_err(ErrorEnvelope::from)?;
    Ok(StartExecutionResponse { execution_id })
  }

  async fn get_execution(&self, execution_id: Uuid) -> BoundaryResult<ExecutionStatusView> {
    self.status_view(execution_id).await
  }

  fn stream_execution(&self, execution_id: Uuid, from_version: i64) -> EventStream {
    let engine = self.engine.clone();
    let stream = async_stream::stream! {
      let history = engine.context_store().history(execution_id).await.unwrap_or_default();
      for commit in history.into_iter().filter(|c| c.version > from_version) {
        yield StreamEvent {
          execution_id,
          version: commit.version,
          kind: EngineEventKind::ContextCommitted,
          payload: serde_json::json!({ "step_id": commit.step_id, "keys": commit.delta.keys().collect::<Vec<_>>() }),
        };
      }

      let mut receiver = engine.subscribe(execution_id);
      loop {
        match receiver.recv().await {
          Ok(event) if event.version > from_version || event.version == 0 => {
            yield StreamEvent { execution_id: event.execution_id, version: event.version, kind: event.kind, payload: event.payload };
          }
          Ok(_) => continue,
          Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
          Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
      }
    };
    Box::pin(stream)
  }

  async fn provide_step_input(&self, req: ProvideStepInputRequest) -> BoundaryResult<()> {
    self.engine
        .provide_step_input(req.execution_id, &req.step_id, req.input.data)
        .await
        .map_err(ErrorEnvelope::from)
  }

  async fn pause(&self, execution_id: Uuid) -> BoundaryResult<()> {
    self.engine.pause(execution_id).await.map_err(ErrorEnvelope::from)
  }

  async fn resume(&self, execution_id: Uuid) -> BoundaryResult<()> {
    self.engine.resume(execution_id).await.map_err(ErrorEnvelope::from)
  }

  async fn cancel(&self, execution_id: Uuid) -> BoundaryResult<()> {
    self.engine.cancel(execution_id).await.map_err(ErrorEnvelope::from)
  }

  async fn list_executions(&self,
                            principal_id: &str,
                            page: Pagination)
                            -> BoundaryResult<workflow_core::Page<WorkflowExecution>> {
    self.engine.list_executions(principal_id, page).await.map_err(ErrorEnvelope::from)
  }
}

/// Maps an error code to its CLI exit code: 1 for a client-caused error
/// (bad input, not found, conflict), 2 for anything that indicates the
/// transport/engine itself misbehaved.
pub fn exit_code_for(code: EngineErrorCode) -> i32 {
  match code {
    EngineErrorCode::NotFound
    | EngineErrorCode::CyclicDependencies
    | EngineErrorCode::UnreachableStep
    | EngineErrorCode::DuplicateStepId
    | EngineErrorCode::InvalidEntryExit
    | EngineErrorCode::UnknownStepKind
    | EngineErrorCode::IncompatibleStepConfig
    | EngineErrorCode::ValidationFailed
    | EngineErrorCode::AiResponseInvalid
    | EngineErrorCode::TerminalState => 1,
    EngineErrorCode::VersionConflict
    | EngineErrorCode::RateLimited
    | EngineErrorCode::Timeout
    | EngineErrorCode::Transient
    | EngineErrorCode::CancellationTimedOut
    | EngineErrorCode::Internal => 2,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeSet;
  use std::sync::Arc;

  use providers::{MockAiProvider, MockMarketDataProvider};
  use step_library::StepLibrary;
  use tokio_stream::StreamExt;
  use workflow_core::{
    InMemoryContextStore, InMemoryExecutionRepository, InMemoryWorkflowRegistry, StepKind, StepSpec,
  };
  use workflow_runtime::EngineOptions;

  fn gateway() -> EngineGateway {
    let library = Arc::new(StepLibrary::new());
    let registry = Arc::new(InMemoryWorkflowRegistry::new().with_config_validator(library.config_validator()));
    let engine = Engine::new(registry,
                              Arc::new(InMemoryContextStore::new()),
                              Arc::new(InMemoryExecutionRepository::new()),
                              library,
                              Arc::new(MockMarketDataProvider::new()),
                              Arc::new(MockAiProvider::new()),
                              EngineOptions::default());
    EngineGateway::new(engine)
  }

  fn constant_step(id: &str, key: &str, value: serde_json::Value) -> StepSpec {
    StepSpec { id: id.into(),
               name: id.into(),
               description: String::new(),
               kind: StepKind::Automated,
               config: serde_json::json!({ "transform": "set_constant", "output_key": key, "value": value }),
               dependencies: Default::default(),
               ai_prompt: None,
               validation_rules: None }
  }

  #[tokio::test]
  async fn start_execution_runs_a_single_step_workflow_to_completion() {
    let gw = gateway();
    let (workflow_id, version) = gw.register_workflow(WorkflowDefinitionInput {
      id: "onboarding".into(),
      name: "Onboarding".into(),
      description: String::new(),
      category: "general".into(),
      steps: vec![constant_step("mark_done", "profile_complete", serde_json::json!(true))],
      entry_points: BTreeSet::from(["mark_done".to_string()]),
      exit_points: BTreeSet::from(["mark_done".to_string()]),
      ai_configurable: false,
    }).await.unwrap();
    assert_eq!(version, 1);

    let resp = gw.start_execution(StartExecutionRequest { workflow_id,
                                                            version: Some(version),
                                                            principal_id: "alice".into(),
                                                            session_id: "sess-1".into(),
                                                            initial_context: Default::default(),
                                                            options: None })
                 .await
                 .unwrap();

    let status = gw.get_execution(resp.execution_id).await.unwrap();
    assert_eq!(status.status, workflow_core::ExecutionStatus::Completed);
    assert_eq!(status.version, 1);
  }

  #[tokio::test]
  async fn stream_execution_replays_committed_history_from_a_cursor() {
    let gw = gateway();
    let (workflow_id, version) = gw.register_workflow(WorkflowDefinitionInput {
      id: "wf".into(),
      name: "wf".into(),
      description: String::new(),
      category: "general".into(),
      steps: vec![constant_step("a", "x", serde_json::json!(1))],
      entry_points: BTreeSet::from(["a".to_string()]),
      exit_points: BTreeSet::from(["a".to_string()]),
      ai_configurable: false,
    }).await.unwrap();

    let resp = gw.start_execution(StartExecutionRequest { workflow_id,
                                                            version: Some(version),
                                                            principal_id: "bob".into(),
                                                            session_id: "sess-2".into(),
                                                            initial_context: Default::default(),
                                                            options: None })
                 .await
                 .unwrap();

    let mut stream = gw.stream_execution(resp.execution_id, 0);
    let first = stream.next().await.expect("at least one committed event on replay");
    assert_eq!(first.kind, EngineEventKind::ContextCommitted);
  }
}

