// Execution State Machine + Scheduler, generalizing
// `chem-workflow::engine::ChemicalFlowEngine`: its
// `persist_step_result` → `update_engine_state_after_persist` sequence
// becomes `commit` → `upsert_step_execution` → `recompute readiness`, run
// once per ready wave instead of once per macro-indexed step. Driven
// synchronously to the next suspension point by every public entry point
// (`start_execution`, `provide_step_input`, `resume`) rather than a
// standing background worker per execution — the engine it generalizes
// is likewise driven synchronously by its caller, one
// `execute_current_step` at a time; see DESIGN.md for this resolution.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use providers::{AiProvider, MarketDataProvider};
use step_library::builtins::evaluate_rule;
use step_library::{StepContext, StepLibrary, StepOutcome};
use workflow_core::{
  ContextSnapshot, ContextStore, ContextValue, EngineError, EngineErrorCode, ErrorInfo, ExecutionRepository,
  ExecutionStatus, Page, Pagination, Result, StepExecution, StepSpec, StepStatus, WorkflowDefinition,
  WorkflowDefinitionInput, WorkflowExecution, WorkflowRegistry, WorkflowSummary,
};

use crate::retry::RetryPolicy;
use crate::scheduler::{partition_by_write_conflict, ready_steps, steps_to_skip};

/// Tunables for one `Engine` instance: dispatch policy, retry defaults,
/// and cancellation grace.
#[derive(Debug, Clone)]
pub struct EngineOptions {
  pub max_parallelism: usize,
  pub step_deadline: Duration,
  pub cancellation_grace: Duration,
  pub retry_policy: RetryPolicy,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self { max_parallelism: 4,
           step_deadline: Duration::from_secs(60),
           cancellation_grace: Duration::from_secs(5),
           retry_policy: RetryPolicy::default() }
  }
}

/// One entry of `StreamExecution`'s `StreamEvent` stream. `version` is
/// the context version the event was raised at, so cursors are idempotent:
/// replay produces the same tail.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineEvent {
  pub execution_id: Uuid,
  pub version: i64,
  pub kind: EngineEventKind,
  pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEventKind {
  StatusChanged,
  StepStarted,
  StepCompleted,
  StepAwaitingInput,
  StepFailed,
  ContextCommitted,
}

struct EngineInner {
  registry: Arc<dyn WorkflowRegistry>,
  context_store: Arc<dyn ContextStore>,
  executions: Arc<dyn ExecutionRepository>,
  step_library: Arc<StepLibrary>,
  market_data: Arc<dyn MarketDataProvider>,
  ai: Arc<dyn AiProvider>,
  options: EngineOptions,
  tokens: DashMap<Uuid, CancellationToken>,
  events: DashMap<Uuid, broadcast::Sender<EngineEvent>>,
}

/// The execution-state-machine-plus-scheduler driver. Cheap to clone
/// (an `Arc` underneath), so a spawned per-step task can hold its own
/// handle back into the engine.
#[derive(Clone)]
pub struct Engine(Arc<EngineInner>);

impl Engine {
  pub fn new(registry: Arc<dyn WorkflowRegistry>,
             context_store: Arc<dyn ContextStore>,
             executions: Arc<dyn ExecutionRepository>,
             step_library: Arc<StepLibrary>,
             market_data: Arc<dyn MarketDataProvider>,
             ai: Arc<dyn AiProvider>,
             options: EngineOptions)
             -> Self {
    Engine(Arc::new(EngineInner { registry,
                                   context_store,
                                   executions,
                                   step_library,
                                   market_data,
                                   ai,
                                   options,
                                   tokens: DashMap::new(),
                                   events: DashMap::new() }))
  }

  pub fn registry(&self) -> &Arc<dyn WorkflowRegistry> {
    &self.0.registry
  }

  pub fn context_store(&self) -> &Arc<dyn ContextStore> {
    &self.0.context_store
  }

  pub fn executions(&self) -> &Arc<dyn ExecutionRepository> {
    &self.0.executions
  }

  /// `Register`: validates and stores the next version of
  /// `input.id`, including per-step config schema checks delegated to
  /// the step library.
  pub async fn register_workflow(&self, input: WorkflowDefinitionInput) -> Result<WorkflowDefinition> {
    self.0.registry.register(input).await
  }

  pub async fn get_workflow(&self, workflow_id: &str, version: Option<i64>) -> Result<WorkflowDefinition> {
    self.0.registry.get(workflow_id, version).await
  }

  pub async fn list_workflows(&self, category: Option<&str>) -> Result<Vec<WorkflowSummary>> {
    self.0.registry.list(category).await
  }

  /// Subscribes to every event raised for `execution_id` from now on,
  /// backing `StreamExecution`. A consumer that wants history too
  /// should pair this with `context_store().history(...)`.
  pub fn subscribe(&self, execution_id: Uuid) -> broadcast::Receiver<EngineEvent> {
    self.0
        .events
        .entry(execution_id)
        .or_insert_with(|| broadcast::channel(256).0)
        .subscribe()
  }

  fn emit(&self, execution_id: Uuid, version: i64, kind: EngineEventKind, payload: serde_json::Value) {
    let sender = self.0.events.entry(execution_id).or_insert_with(|| broadcast::channel(256).0);
    // No subscribers is not an error: events are best-effort fan-out, the
    // durable record of what happened is the execution/step/context tables.
    let _ = sender.send(EngineEvent { execution_id, version, kind, payload });
  }

  fn token_for(&self, execution_id: Uuid) -> CancellationToken {
    self.0.tokens.entry(execution_id).or_insert_with(CancellationToken::new).clone()
  }

  /// `StartExecution`: creates the execution record, commits
  /// `initial_context` as its first delta if non-empty, then drives to the
  /// first suspension point.
  #[allow(clippy::too_many_arguments)]
  pub async fn start_execution(&self,
                                workflow_id: &str,
                                version: Option<i64>,
                                initial_context: IndexMap<String, ContextValue>,
                                principal_id: String,
                                session_id: String)
                                -> Result<Uuid> {
    let def = self.0.registry.get(workflow_id, version).await?;
    let execution_id = Uuid::new_v4();
    let now = Utc::now();

    let mut context_version = 0i64;
    if !initial_context.is_empty() {
      match self.0.context_store.commit(execution_id, "__init__", initial_context, 0).await? {
        workflow_core::PersistResult::Ok { new_version } => context_version = new_version,
        workflow_core::PersistResult::Conflict => {
          return Err(EngineError::Internal("initial context commit conflicted on a brand-new execution".into()))
        }
      }
    }

    let execution = WorkflowExecution { execution_id,
                                         workflow_id: def.id.clone(),
                                         workflow_version: def.version,
                                         principal_id,
                                         session_id,
                                         status: ExecutionStatus::Pending,
                                         current_steps: Default::default(),
                                         started_at: now,
                                         updated_at: now,
                                         completed_at: None,
                                         error: None };
    self.0.executions.insert_execution(execution).await?;
    self.emit(execution_id, context_version, EngineEventKind::StatusChanged, json!({ "status": "PENDING" }));

    self.transition_status(execution_id, ExecutionStatus::Running).await?;
    self.drive(execution_id).await?;
    Ok(execution_id)
  }

  pub async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution> {
    self.0.executions.get_execution(execution_id).await
  }

  pub async fn list_step_executions(&self, execution_id: Uuid) -> Result<Vec<StepExecution>> {
    self.0.executions.list_step_executions(execution_id).await
  }

  pub async fn list_executions(&self, principal_id: &str, pagination: Pagination) -> Result<Page<WorkflowExecution>> {
    self.0.executions.list_executions(principal_id, pagination).await
  }

  /// `ProvideStepInput`: resumes one `AWAITING_INPUT` step,
  /// then drives to the next suspension point.
  pub async fn provide_step_input(&self,
                                   execution_id: Uuid,
                                   step_id: &str,
                                   input: IndexMap<String, ContextValue>)
                                   -> Result<()> {
    let execution = self.0.executions.get_execution(execution_id).await?;
    if execution.status.is_terminal() {
      return Err(EngineError::TerminalState(format!("execution {execution_id} is already {:?}", execution.status)));
    }
    let step_exec = self.0
                        .executions
                        .get_step_execution(execution_id, step_id)
                        .await?
                        .ok_or_else(|| EngineError::NotFound(format!("step execution {execution_id}/{step_id}")))?;
    if step_exec.status != StepStatus::AwaitingInput {
      return Err(EngineError::ValidationFailed(format!("step '{step_id}' is not awaiting input")));
    }

    let def = self.0.registry.get(&execution.workflow_id, Some(execution.workflow_version)).await?;
    let step = def.step(step_id).ok_or_else(|| EngineError::NotFound(format!("step {step_id}")))?;
    let executor = self.0.step_library.resolve(step.kind)?;

    let snapshot = self.0.context_store.snapshot(execution_id).await?;
    let step_ctx = StepContext { snapshot, market_data: self.0.market_data.clone(), ai: self.0.ai.clone(),
                                  cancellation: self.token_for(execution_id) };
    let outcome = executor.provide_input(step, &step_ctx, input).await;
    // A rejected resubmission (bad selection, out-of-range decision, ...) is
    // the caller's mistake, not an executor failure: report it and leave the
    // step AWAITING_INPUT so the caller can resubmit, rather than failing the
    // whole execution ( S3: a too-small selection fails
    // `ValidationFailed` and the execution stays resumable).
    if let StepOutcome::Failed { code, message, .. } = outcome {
      return Err(EngineError::from_code(code, message));
    }
    self.finish_step(execution_id, step, step_exec.attempt, outcome).await?;

    // "execution resumes and completes": once this was the last
    // AWAITING_INPUT step, the execution auto-resumes to RUNNING without
    // requiring a separate explicit `Resume` call.
    let still_awaiting =
      self.step_statuses(execution_id).await?.into_values().any(|s| s == StepStatus::AwaitingInput);
    if !still_awaiting {
      let execution = self.0.executions.get_execution(execution_id).await?;
      if !execution.status.is_terminal() {
        self.transition_status(execution_id, ExecutionStatus::Running).await?;
      }
    }
    self.drive(execution_id).await
  }

  pub async fn pause(&self, execution_id: Uuid) -> Result<()> {
    let execution = self.0.executions.get_execution(execution_id).await?;
    if execution.status.is_terminal() {
      return Err(EngineError::TerminalState(format!("execution {execution_id} is already {:?}", execution.status)));
    }
    self.transition_status(execution_id, ExecutionStatus::Paused).await
  }

  pub async fn resume(&self, execution_id: Uuid) -> Result<()> {
    let execution = self.0.executions.get_execution(execution_id).await?;
    if execution.status.is_terminal() {
      return Err(EngineError::TerminalState(format!("execution {execution_id} is already {:?}", execution.status)));
    }
    let still_awaiting = self.0
                             .executions
                             .list_step_executions(execution_id)
                             .await?
                             .into_iter()
                             .any(|s| s.status == StepStatus::AwaitingInput);
    if still_awaiting {
      return Err(EngineError::ValidationFailed("one or more steps are still awaiting input".into()));
    }
    self.transition_status(execution_id, ExecutionStatus::Running).await?;
    self.drive(execution_id).await
  }

  /// `Cancel`: marks the execution CANCELLED immediately
  /// and signals cooperative cancellation to any in-flight step.
  pub async fn cancel(&self, execution_id: Uuid) -> Result<()> {
    let execution = self.0.executions.get_execution(execution_id).await?;
    if execution.status.is_terminal() {
      return Err(EngineError::TerminalState(format!("execution {execution_id} is already {:?}", execution.status)));
    }
    self.token_for(execution_id).cancel();
    self.transition_status(execution_id, ExecutionStatus::Cancelled).await
  }

  async fn transition_status(&self, execution_id: Uuid, status: ExecutionStatus) -> Result<()> {
    let mut execution = self.0.executions.get_execution(execution_id).await?;
    if execution.status == status {
      return Ok(());
    }
    execution.status = status;
    execution.updated_at = Utc::now();
    if status.is_terminal() {
      execution.completed_at = Some(execution.updated_at);
    }
    self.0.executions.update_execution(execution).await?;
    self.emit(execution_id, 0, EngineEventKind::StatusChanged, json!({ "status": format!("{status:?}").to_uppercase() }));
    Ok(())
  }

  async fn fail_execution(&self, execution_id: Uuid, error: ErrorInfo) -> Result<()> {
    let mut execution = self.0.executions.get_execution(execution_id).await?;
    if execution.status.is_terminal() {
      return Ok(());
    }
    self.token_for(execution_id).cancel();
    execution.status = ExecutionStatus::Failed;
    execution.error = Some(error);
    execution.updated_at = Utc::now();
    execution.completed_at = Some(execution.updated_at);
    self.0.executions.update_execution(execution).await?;
    self.emit(execution_id, 0, EngineEventKind::StatusChanged, json!({ "status": "FAILED" }));
    Ok(())
  }

  async fn step_statuses(&self, execution_id: Uuid) -> Result<HashMap<String, StepStatus>> {
    let steps = self.0.executions.list_step_executions(execution_id).await?;
    Ok(steps.into_iter().map(|s| (s.step_id, s.status)).collect())
  }

  /// Drives `execution_id` forward, dispatching every ready wave, until it
  /// reaches a terminal status or a suspension point.
  async fn drive(&self, execution_id: Uuid) -> Result<()> {
    loop {
      let execution = self.0.executions.get_execution(execution_id).await?;
      if execution.status.is_terminal() || execution.status == ExecutionStatus::Paused {
        return Ok(());
      }

      let def = self.0.registry.get(&execution.workflow_id, Some(execution.workflow_version)).await?;
      let mut statuses = self.step_statuses(execution_id).await?;

      let to_skip = steps_to_skip(&def, &statuses);
      if !to_skip.is_empty() {
        for step in to_skip {
          self.mark_step(execution_id, step, StepStatus::Pending, StepStatus::Skipped, 0, None).await?;
          statuses.insert(step.id.clone(), StepStatus::Skipped);
        }
        continue;
      }

      let ready = ready_steps(&def, &statuses);
      if ready.is_empty() {
        if self.exit_points_completed(&def, &statuses) {
          self.transition_status(execution_id, ExecutionStatus::Completed).await?;
        } else if statuses.values().any(|s| *s == StepStatus::AwaitingInput) {
          self.transition_status(execution_id, ExecutionStatus::Paused).await?;
        }
        return Ok(());
      }

      let waves = partition_by_write_conflict(ready, |s| self.0.step_library.output_keys(s));
      for wave in waves {
        for chunk in wave.chunks(self.0.options.max_parallelism) {
          let mut join_set = tokio::task::JoinSet::new();
          for step in chunk {
            let engine = self.clone();
            let step = (*step).clone();
            join_set.spawn(async move { engine.execute_step(execution_id, &step).await });
          }
          while let Some(res) = join_set.join_next().await {
            res.map_err(|e| EngineError::Internal(format!("step task panicked: {e}")))??;
          }
        }
      }

      let execution = self.0.executions.get_execution(execution_id).await?;
      if execution.status.is_terminal() {
        return Ok(());
      }
    }
  }

  fn exit_points_completed(&self, def: &WorkflowDefinition, statuses: &HashMap<String, StepStatus>) -> bool {
    def.exit_points.iter().all(|id| statuses.get(id).copied() == Some(StepStatus::Completed))
  }

  async fn mark_step(&self,
                      execution_id: Uuid,
                      step: &StepSpec,
                      _from: StepStatus,
                      to: StepStatus,
                      attempt: u32,
                      error: Option<ErrorInfo>)
                      -> Result<()> {
    let now = Utc::now();
    let existing = self.0.executions.get_step_execution(execution_id, &step.id).await?;
    let step_exec = StepExecution { execution_id,
                                     step_id: step.id.clone(),
                                     status: to,
                                     attempt: attempt.max(existing.as_ref().map(|s| s.attempt).unwrap_or(0)),
                                     started_at: existing.as_ref().and_then(|s| s.started_at).or(Some(now)),
                                     finished_at: if to.is_terminal() { Some(now) } else { None },
                                     duration_ms: None,
                                     input_snapshot: existing.as_ref().map(|s| s.input_snapshot.clone())
                                                             .unwrap_or(serde_json::Value::Null),
                                     output: existing.and_then(|s| s.output),
                                     error };
    self.0.executions.upsert_step_execution(step_exec).await
  }

  /// Runs one step to a terminal per-attempt outcome, handling retries and
  /// version-conflict re-dispatch inline. Bounded by `attempt <=
  /// retry_policy.max_attempts`, where `retry_policy` is resolved per step
  /// from `StepSpec.config.retry` (falling back to `EngineOptions.retry_policy`
  /// field by field).
  async fn execute_step(&self, execution_id: Uuid, step: &StepSpec) -> Result<()> {
    let mut attempt =
      self.0.executions.get_step_execution(execution_id, &step.id).await?.map(|s| s.attempt).unwrap_or(0);

    loop {
      attempt += 1;
      let execution = self.0.executions.get_execution(execution_id).await?;
      if execution.status.is_terminal() {
        return Ok(());
      }

      self.mark_running(execution_id, step, attempt).await?;
      self.emit(execution_id, 0, EngineEventKind::StepStarted, json!({ "step_id": step.id, "attempt": attempt }));

      let cancellation = self.token_for(execution_id);
      let executor = self.0.step_library.resolve(step.kind)?;
      let snapshot = self.0.context_store.snapshot(execution_id).await?;
      let input_snapshot = snapshot_to_json(&snapshot.data);
      let step_ctx = StepContext { snapshot, market_data: self.0.market_data.clone(), ai: self.0.ai.clone(),
                                    cancellation: cancellation.clone() };

      let outcome = self.run_with_cancellation(executor.clone(), step.clone(), step_ctx, cancellation).await;

      // Record what the executor actually saw, for audit (
      // `StepExecution.input_snapshot`).
      if let Some(mut existing) = self.0.executions.get_step_execution(execution_id, &step.id).await? {
        existing.input_snapshot = input_snapshot;
        self.0.executions.upsert_step_execution(existing).await?;
      }

      let retry_policy = RetryPolicy::from_step_config(&step.config, self.0.options.retry_policy);
      match outcome {
        StepOutcome::Failed { retryable: true, code, message } if !retry_policy.exhausted(attempt) => {
          tokio::time::sleep(retry_policy.delay_for(attempt)).await;
          let _ = code;
          let _ = message;
          continue;
        }
        other => {
          self.finish_step(execution_id, step, attempt, other).await?;
          return Ok(());
        }
      }
    }
  }

  async fn mark_running(&self, execution_id: Uuid, step: &StepSpec, attempt: u32) -> Result<()> {
    let mut execution = self.0.executions.get_execution(execution_id).await?;
    execution.current_steps.insert(step.id.clone());
    execution.updated_at = Utc::now();
    self.0.executions.update_execution(execution).await?;

    let now = Utc::now();
    let existing = self.0.executions.get_step_execution(execution_id, &step.id).await?;
    self.0
        .executions
        .upsert_step_execution(StepExecution { execution_id,
                                                step_id: step.id.clone(),
                                                status: StepStatus::Running,
                                                attempt,
                                                started_at: existing.as_ref().and_then(|s| s.started_at).or(Some(now)),
                                                finished_at: None,
                                                duration_ms: None,
                                                input_snapshot: serde_json::Value::Null,
                                                output: existing.and_then(|s| s.output),
                                                error: None })
        .await
  }

  /// Races the executor call against its deadline and against cooperative
  /// cancellation, giving an in-flight executor `cancellation_grace` to
  /// honour the signal before the step is forced to `CancellationTimedOut`.
  async fn run_with_cancellation(&self,
                                  executor: Arc<dyn step_library::Executor>,
                                  step: StepSpec,
                                  step_ctx: StepContext,
                                  cancellation: CancellationToken)
                                  -> StepOutcome {
    let deadline = self.0.options.step_deadline;
    let mut handle = tokio::spawn(async move {
      match tokio::time::timeout(deadline, executor.execute(&step, &step_ctx)).await {
        Ok(outcome) => outcome,
        Err(_) => StepOutcome::Failed { code: EngineErrorCode::Timeout,
                                         message: "step exceeded its deadline".into(),
                                         retryable: true },
      }
    });

    tokio::select! {
      res = &mut handle => res.unwrap_or_else(|e| StepOutcome::Failed {
        code: EngineErrorCode::Internal,
        message: format!("step task panicked: {e}"),
        retryable: false,
      }),
      _ = cancellation.cancelled() => {
        match tokio::time::timeout(self.0.options.cancellation_grace, &mut handle).await {
          Ok(Ok(_outcome)) => StepOutcome::Skipped { reason: "cancelled".into() },
          _ => {
            handle.abort();
            StepOutcome::Failed {
              code: EngineErrorCode::CancellationTimedOut,
              message: "step did not honour cancellation within the grace period".into(),
              retryable: false,
            }
          }
        }
      }
    }
  }

  /// Applies post-step `validation_rules` (evaluated "after the
  /// executor returns, before the result is committed"), commits a `Done`
  /// delta with version-conflict retry, and records the
  /// step's terminal status for this attempt.
  async fn finish_step(&self, execution_id: Uuid, step: &StepSpec, attempt: u32, outcome: StepOutcome) -> Result<()> {
    let mut execution = self.0.executions.get_execution(execution_id).await?;
    execution.current_steps.remove(&step.id);

    match outcome {
      StepOutcome::Done { delta } => {
        if let Some(rules) = &step.validation_rules {
          let snapshot = self.0.context_store.snapshot(execution_id).await?;
          let mut merged = snapshot.data.clone();
          for (k, v) in &delta {
            merged.insert(k.clone(), v.clone());
          }
          let merged_snapshot = ContextSnapshot { data: merged, version: snapshot.version };
          if let Some(message) = rules.iter().find_map(|rule| evaluate_rule(rule, &merged_snapshot).err()) {
            execution.updated_at = Utc::now();
            self.0.executions.update_execution(execution).await?;
            return self.record_step_failure(execution_id, step, attempt, EngineErrorCode::ValidationFailed, message, false)
                       .await;
          }
        }

        let retry_policy = RetryPolicy::from_step_config(&step.config, self.0.options.retry_policy);
        let mut version_attempts = 0u32;
        loop {
          version_attempts += 1;

          // Re-check before every commit attempt, not after: a step that
          // completes after cancellation must have its result dropped, so
          // the commit itself must never happen once the execution has
          // gone terminal, not just the step's COMPLETED row.
          let current = self.0.executions.get_execution(execution_id).await?;
          if current.status.is_terminal() {
            return Ok(());
          }

          let snapshot = self.0.context_store.snapshot(execution_id).await?;
          match self.0.context_store.commit(execution_id, &step.id, delta.clone(), snapshot.version).await? {
            workflow_core::PersistResult::Ok { new_version } => {
              self.emit(execution_id, new_version, EngineEventKind::ContextCommitted,
                        json!({ "step_id": step.id, "keys": delta.keys().collect::<Vec<_>>() }));

              execution.updated_at = Utc::now();
              self.0.executions.update_execution(execution).await?;

              let now = Utc::now();
              let existing = self.0.executions.get_step_execution(execution_id, &step.id).await?;
              let duration_ms =
                existing.as_ref().and_then(|s| s.started_at).map(|s| (now - s).num_milliseconds());
              self.0
                  .executions
                  .upsert_step_execution(StepExecution { execution_id,
                                                          step_id: step.id.clone(),
                                                          status: StepStatus::Completed,
                                                          attempt,
                                                          started_at: existing.as_ref().and_then(|s| s.started_at),
                                                          finished_at: Some(now),
                                                          duration_ms,
                                                          input_snapshot: existing.map(|s| s.input_snapshot)
                                                                                  .unwrap_or(serde_json::Value::Null),
                                                          output: Some(delta_to_json(&delta)),
                                                          error: None })
                  .await?;
              self.emit(execution_id, new_version, EngineEventKind::StepCompleted, json!({ "step_id": step.id }));
              return Ok(());
            }
            workflow_core::PersistResult::Conflict => {
              if version_attempts >= retry_policy.max_attempts {
                return self.record_step_failure(execution_id,
                                                  step,
                                                  attempt,
                                                  EngineErrorCode::VersionConflict,
                                                  "context version conflict exceeded the retry budget".into(),
                                                  false)
                           .await;
              }
              continue;
            }
          }
        }
      }

      StepOutcome::AwaitInput { prompt, expected_keys } => {
        execution.updated_at = Utc::now();
        execution.current_steps.insert(step.id.clone());
        self.0.executions.update_execution(execution).await?;
        self.transition_status(execution_id, ExecutionStatus::Paused).await?;

        let existing = self.0.executions.get_step_execution(execution_id, &step.id).await?;
        self.0
            .executions
            .upsert_step_execution(StepExecution { execution_id,
                                                    step_id: step.id.clone(),
                                                    status: StepStatus::AwaitingInput,
                                                    attempt,
                                                    started_at: existing.as_ref().and_then(|s| s.started_at),
                                                    finished_at: None,
                                                    duration_ms: None,
                                                    input_snapshot: existing.map(|s| s.input_snapshot)
                                                                            .unwrap_or(serde_json::Value::Null),
                                                    output: None,
                                                    error: None })
            .await?;
        self.emit(execution_id, 0, EngineEventKind::StepAwaitingInput,
                  json!({ "step_id": step.id, "prompt": prompt, "expected_keys": expected_keys }));
        Ok(())
      }

      StepOutcome::Skipped { reason: _ } => {
        execution.updated_at = Utc::now();
        self.0.executions.update_execution(execution).await?;
        self.mark_step(execution_id, step, StepStatus::Running, StepStatus::Skipped, attempt, None).await
      }

      StepOutcome::Failed { code, message, retryable } => {
        execution.updated_at = Utc::now();
        self.0.executions.update_execution(execution).await?;
        self.record_step_failure(execution_id, step, attempt, code, message, retryable).await
      }
    }
  }

  async fn record_step_failure(&self,
                                execution_id: Uuid,
                                step: &StepSpec,
                                attempt: u32,
                                code: EngineErrorCode,
                                message: String,
                                retryable: bool)
                                -> Result<()> {
    let error = ErrorInfo { code, message: message.clone(), retryable, details: None };
    self.mark_step(execution_id, step, StepStatus::Running, StepStatus::Failed, attempt, Some(error.clone())).await?;
    self.emit(execution_id, 0, EngineEventKind::StepFailed, json!({ "step_id": step.id, "code": format!("{code:?}") }));

    // : "non-retryable errors end the execution in FAILED; any
    // other RUNNING steps in the same execution are cancelled."
    self.fail_execution(execution_id, error).await
  }
}

fn snapshot_to_json(data: &IndexMap<String, ContextValue>) -> serde_json::Value {
  serde_json::Value::Object(data.iter().map(|(k, v)| (k.clone(), v.to_plain_json())).collect())
}

fn delta_to_json(delta: &IndexMap<String, ContextValue>) -> serde_json::Value {
  snapshot_to_json(delta)
}

#[cfg(test)]
mod tests {
  use providers::{MockAiProvider, MockMarketDataProvider};
  use serde_json::json;
  use workflow_core::{
    EngineErrorCode, InMemoryContextStore, InMemoryExecutionRepository, InMemoryWorkflowRegistry, StepKind,
    WorkflowDefinitionInput,
  };

  use super::*;

  fn engine_with(ai: Arc<dyn AiProvider>, options: EngineOptions) -> Engine {
    let library = Arc::new(StepLibrary::new());
    Engine::new(Arc::new(InMemoryWorkflowRegistry::new().with_config_validator(library.config_validator())),
                Arc::new(InMemoryContextStore::new()),
                Arc::new(InMemoryExecutionRepository::new()),
                library,
                Arc::new(MockMarketDataProvider::new()),
                ai,
                options)
  }

  fn engine() -> Engine {
    engine_with(Arc::new(MockAiProvider::new()), EngineOptions::default())
  }

  fn step(id: &str, kind: StepKind, config: serde_json::Value, deps: &[&str]) -> StepSpec {
    StepSpec { id: id.into(),
               name: id.into(),
               description: String::new(),
               kind,
               config,
               dependencies: deps.iter().map(|s| s.to_string()).collect(),
               ai_prompt: None,
               validation_rules: None }
  }

  fn input(id: &str, steps: Vec<StepSpec>, entry: &[&str], exit: &[&str]) -> WorkflowDefinitionInput {
    WorkflowDefinitionInput { id: id.into(),
                              name: id.into(),
                              description: String::new(),
                              category: "general".into(),
                              steps,
                              entry_points: entry.iter().map(|s| s.to_string()).collect(),
                              exit_points: exit.iter().map(|s| s.to_string()).collect(),
                              ai_configurable: false }
  }

  async fn status_of(engine: &Engine, execution_id: Uuid, step_id: &str) -> StepStatus {
    engine.list_step_executions(execution_id)
          .await
          .unwrap()
          .into_iter()
          .find(|s| s.step_id == step_id)
          .map(|s| s.status)
          .unwrap_or(StepStatus::Pending)
  }

  /// A three-step profile-then-allocate sequence, resumed by two successive
  /// `ProvideStepInput` calls with no intervening explicit `Resume`.
  #[tokio::test]
  async fn linear_workflow_completes_across_two_awaited_inputs() {
    let engine = engine();
    let def = input("profile",
                     vec![step("a",
                                StepKind::DataCollection,
                                json!({ "fields": [ { "name": "risk_tolerance", "type": "string", "required": true } ] }),
                                &[]),
                          step("b",
                                StepKind::Decision,
                                json!({ "inputType": "single", "options": ["conservative", "balanced", "aggressive"] }),
                                &["a"]),
                          step("c",
                                StepKind::Automated,
                                json!({ "transform": "set_constant", "output_key": "profile_complete", "value": true }),
                                &["b"])],
                     &["a"],
                     &["c"]);
    engine.register_workflow(def).await.unwrap();

    let execution_id =
      engine.start_execution("profile", None, IndexMap::new(), "alice".into(), "s1".into()).await.unwrap();
    assert_eq!(engine.get_execution(execution_id).await.unwrap().status, ExecutionStatus::Paused);
    assert_eq!(status_of(&engine, execution_id, "a").await, StepStatus::AwaitingInput);

    let mut a_input = IndexMap::new();
    a_input.insert("risk_tolerance".to_string(), ContextValue::String("moderate".into()));
    engine.provide_step_input(execution_id, "a", a_input).await.unwrap();
    assert_eq!(engine.get_execution(execution_id).await.unwrap().status, ExecutionStatus::Paused);
    assert_eq!(status_of(&engine, execution_id, "b").await, StepStatus::AwaitingInput);

    let mut b_input = IndexMap::new();
    b_input.insert("chosen".to_string(), ContextValue::String("balanced".into()));
    engine.provide_step_input(execution_id, "b", b_input).await.unwrap();

    let execution = engine.get_execution(execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let snapshot = engine.context_store().snapshot(execution_id).await.unwrap();
    assert_eq!(snapshot.data.get("risk_tolerance").and_then(|v| v.as_str()), Some("moderate"));
    assert_eq!(snapshot.data.get("decision_b").and_then(|v| v.as_str()), Some("balanced"));
    assert_eq!(snapshot.data.get("profile_complete").and_then(|v| v.as_bool()), Some(true));
  }

  /// A resubmission that fails the selection's minimum leaves the step
  /// AWAITING_INPUT and the execution resumable rather than failing it; a
  /// corrected resubmission then auto-resumes the execution to completion.
  #[tokio::test]
  async fn a_rejected_resubmission_stays_resumable_and_a_corrected_one_completes() {
    let engine = engine();
    let def = input("select",
                     vec![step("sel",
                                StepKind::UserInteraction,
                                json!({ "items": ["x", "y", "v", "w", "z"], "minSelections": 2 }),
                                &[])],
                     &["sel"],
                     &["sel"]);
    engine.register_workflow(def).await.unwrap();

    let execution_id =
      engine.start_execution("select", None, IndexMap::new(), "alice".into(), "s1".into()).await.unwrap();
    assert_eq!(engine.get_execution(execution_id).await.unwrap().status, ExecutionStatus::Paused);

    let mut too_few = IndexMap::new();
    too_few.insert("selection".to_string(), ContextValue::List(vec![ContextValue::String("x".into())]));
    let err = engine.provide_step_input(execution_id, "sel", too_few).await.unwrap_err();
    assert!(matches!(err, EngineError::ValidationFailed(_)));
    assert_eq!(engine.get_execution(execution_id).await.unwrap().status, ExecutionStatus::Paused);
    assert_eq!(status_of(&engine, execution_id, "sel").await, StepStatus::AwaitingInput);

    let mut enough = IndexMap::new();
    enough.insert("selection".to_string(),
                   ContextValue::List(vec![ContextValue::String("x".into()), ContextValue::String("y".into())]));
    engine.provide_step_input(execution_id, "sel", enough).await.unwrap();
    assert_eq!(engine.get_execution(execution_id).await.unwrap().status, ExecutionStatus::Completed);
  }

  /// A schema-invalid AI response exhausts the retry budget and ends the
  /// execution FAILED, tagged with the AI-specific error code.
  #[tokio::test]
  async fn an_ai_response_that_never_matches_the_schema_exhausts_retries_and_fails() {
    let ai = Arc::new(MockAiProvider::new());
    ai.seed("propose an allocation\n\ncontext: {}", r#"{"allocation":"n/a"}"#, "test-model");
    let retry_policy = RetryPolicy { max_attempts: 3,
                                      base_delay: Duration::from_millis(1),
                                      max_delay: Duration::from_millis(2) };
    let engine = engine_with(ai, EngineOptions { retry_policy, ..EngineOptions::default() });

    let mut step = step("g",
                         StepKind::AiGenerated,
                         json!({
                           "response_schema": [ { "key": "allocation", "type": "map<string,number>" } ],
                           "allowed_context_keys": [],
                           "sensitive_keys": []
                         }),
                         &[]);
    step.ai_prompt = Some("propose an allocation".into());
    let def = input("allocate", vec![step], &["g"], &["g"]);
    engine.register_workflow(def).await.unwrap();

    let execution_id =
      engine.start_execution("allocate", None, IndexMap::new(), "alice".into(), "s1".into()).await.unwrap();
    let execution = engine.get_execution(execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_ref().map(|e| e.code), Some(EngineErrorCode::AiResponseInvalid));
  }

  /// Terminal executions are write-once: every mutating call rejects once
  /// an execution has reached a terminal status.
  #[tokio::test]
  async fn terminal_executions_reject_every_further_mutation() {
    let engine = engine();
    let def = input("const",
                     vec![step("a",
                                StepKind::Automated,
                                json!({ "transform": "set_constant", "output_key": "done", "value": true }),
                                &[])],
                     &["a"],
                     &["a"]);
    engine.register_workflow(def).await.unwrap();

    let execution_id =
      engine.start_execution("const", None, IndexMap::new(), "alice".into(), "s1".into()).await.unwrap();
    assert_eq!(engine.get_execution(execution_id).await.unwrap().status, ExecutionStatus::Completed);

    assert!(matches!(engine.pause(execution_id).await.unwrap_err(), EngineError::TerminalState(_)));
    assert!(matches!(engine.resume(execution_id).await.unwrap_err(), EngineError::TerminalState(_)));
    assert!(matches!(engine.cancel(execution_id).await.unwrap_err(), EngineError::TerminalState(_)));
    assert!(matches!(engine.provide_step_input(execution_id, "a", IndexMap::new()).await.unwrap_err(),
                      EngineError::TerminalState(_)));
  }
}
