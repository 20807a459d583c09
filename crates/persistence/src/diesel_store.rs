// Diesel-backed implementations of `workflow_core`'s `ContextStore`,
// `ExecutionRepository` and `WorkflowRegistry`, generalized from the
// teacher's single `DieselDomainRepository` (r2d2 pool + dual Pg/SQLite
// connection via `cfg(feature = "pg")`, `embed_migrations!` run on
// construction) into three traits instead of one, matching the shape
// `workflow-core` now exposes.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::result::Error as DieselError;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use indexmap::IndexMap;
use uuid::Uuid;

use workflow_core::context::ContextStore;
use workflow_core::domain::{
  ContextCommit, ContextSnapshot, ContextValue, ExecutionStatus, Page, Pagination, PersistResult, StepExecution, StepStatus,
  WorkflowDefinition, WorkflowDefinitionInput, WorkflowExecution, WorkflowSummary,
};
use workflow_core::errors::{EngineError, Result};
use workflow_core::registry::{validate_definition, ConfigValidator, WorkflowRegistry};
use workflow_core::repository::{is_valid_transition, ExecutionRepository};

use crate::schema;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

#[cfg(all(feature = "pg", not(test)))]
type DbPool = Pool<ConnectionManager<PgConnection>>;
#[cfg(any(test, not(feature = "pg")))]
type DbPool = Pool<ConnectionManager<SqliteConnection>>;
#[cfg(all(feature = "pg", not(test)))]
type DbConn = PgConnection;
#[cfg(any(test, not(feature = "pg")))]
type DbConn = SqliteConnection;

fn build_pool(database_url: &str) -> DbPool {
  #[cfg(any(test, not(feature = "pg")))]
  let manager = ConnectionManager::<SqliteConnection>::new(database_url);
  #[cfg(all(feature = "pg", not(test)))]
  let manager = ConnectionManager::<PgConnection>::new(database_url);
  Pool::builder().max_size(8).build(manager).expect("failed to build connection pool")
}

/// Opens a pool against `database_url`, runs pending migrations, and hands
/// back the three store handles that share it.
pub fn connect(database_url: &str) -> Result<(DieselContextStore, DieselExecutionRepository, DieselWorkflowRegistry)> {
  let pool = Arc::new(build_pool(database_url));
  {
    let mut conn = pool.get().map_err(|e| EngineError::Storage(format!("pool: {e}")))?;
    #[cfg(any(test, not(feature = "pg")))]
    {
      let _ = diesel::sql_query("PRAGMA journal_mode = WAL;").execute(&mut conn);
      let _ = diesel::sql_query("PRAGMA busy_timeout = 5000;").execute(&mut conn);
    }
    conn.run_pending_migrations(MIGRATIONS).map_err(|e| EngineError::Storage(format!("migrations: {e}")))?;
  }
  Ok((DieselContextStore { pool: pool.clone() },
      DieselExecutionRepository { pool: pool.clone() },
      DieselWorkflowRegistry { pool, config_validator: None }))
}

/// Reads `DATABASE_URL` (or `WORKFLOW_DB_URL`) from the environment / a
/// `.env` file, the same fallback order a prior `new_from_env` used
/// for `CHEM_DB_URL`/`DATABASE_URL`.
pub fn new_from_env() -> Result<(DieselContextStore, DieselExecutionRepository, DieselWorkflowRegistry)> {
  dotenvy::dotenv().ok();
  let url = std::env::var("WORKFLOW_DB_URL")
    .or_else(|_| std::env::var("DATABASE_URL"))
    .map_err(|_| EngineError::Storage("WORKFLOW_DB_URL/DATABASE_URL not set".into()))?;
  connect(&url)
}

async fn blocking<F, T>(f: F) -> Result<T>
  where F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static
{
  match tokio::task::spawn_blocking(f).await {
    Ok(res) => res,
    Err(e) => Err(EngineError::Internal(format!("blocking task panicked: {e}"))),
  }
}

fn map_db_err<T>(res: std::result::Result<T, DieselError>) -> Result<T> {
  res.map_err(|e| EngineError::Storage(format!("db: {e}")))
}

/// `diesel::Connection::transaction` requires its error type to implement
/// `From<diesel::result::Error>` (for `?` on the driver calls), which
/// `EngineError` cannot do from here without violating the orphan rule
/// (neither type lives in this crate). This thin wrapper carries either
/// side home across the transaction boundary.
enum TxError {
  Engine(EngineError),
  Db(DieselError),
}

impl From<DieselError> for TxError {
  fn from(e: DieselError) -> Self {
    TxError::Db(e)
  }
}

impl From<EngineError> for TxError {
  fn from(e: EngineError) -> Self {
    TxError::Engine(e)
  }
}

impl From<TxError> for EngineError {
  fn from(e: TxError) -> Self {
    match e {
      TxError::Engine(e) => e,
      TxError::Db(e) => EngineError::Storage(format!("db: {e}")),
    }
  }
}

fn conn_of(pool: &DbPool) -> Result<PooledConnection<ConnectionManager<DbConn>>> {
  pool.get().map_err(|e| EngineError::Storage(format!("pool: {e}")))
}

fn ms_of(dt: DateTime<Utc>) -> i64 {
  dt.timestamp_millis()
}

fn dt_of(ms: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
  serde_json::to_string(value).map_err(EngineError::Serialization)
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
  serde_json::from_str(raw).map_err(EngineError::Serialization)
}

// --- workflow_definitions --------------------------------------------------

#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = schema::workflow_definitions)]
struct WorkflowDefinitionRow {
  workflow_id: String,
  version: i64,
  name: String,
  description: String,
  category: String,
  steps_json: String,
  entry_points_json: String,
  exit_points_json: String,
  ai_configurable: bool,
}

impl WorkflowDefinitionRow {
  fn from_definition(def: &WorkflowDefinition) -> Result<Self> {
    Ok(Self { workflow_id: def.id.clone(),
              version: def.version,
              name: def.name.clone(),
              description: def.description.clone(),
              category: def.category.clone(),
              steps_json: to_json(&def.steps)?,
              entry_points_json: to_json(&def.entry_points)?,
              exit_points_json: to_json(&def.exit_points)?,
              ai_configurable: def.ai_configurable })
  }

  fn into_definition(self) -> Result<WorkflowDefinition> {
    Ok(WorkflowDefinition { id: self.workflow_id,
                             version: self.version,
                             name: self.name,
                             description: self.description,
                             category: self.category,
                             steps: from_json(&self.steps_json)?,
                             entry_points: from_json(&self.entry_points_json)?,
                             exit_points: from_json(&self.exit_points_json)?,
                             ai_configurable: self.ai_configurable })
  }
}

/// Diesel-backed `WorkflowRegistry`. Versions are append-only rows keyed
/// by `(workflow_id, version)`; `register` reads the current max version
/// under the same connection and inserts `max + 1`.
pub struct DieselWorkflowRegistry {
  pool: Arc<DbPool>,
  config_validator: Option<ConfigValidator>,
}

impl DieselWorkflowRegistry {
  pub fn with_config_validator(mut self, validator: ConfigValidator) -> Self {
    self.config_validator = Some(validator);
    self
  }
}

#[async_trait]
impl WorkflowRegistry for DieselWorkflowRegistry {
  async fn register(&self, input: WorkflowDefinitionInput) -> Result<WorkflowDefinition> {
    validate_definition(&input)?;
    if let Some(validator) = &self.config_validator {
      for step in &input.steps {
        validator(step.kind, &step.config)?;
      }
    }
    let pool = self.pool.clone();
    blocking(move || {
      use schema::workflow_definitions::dsl;
      let mut conn = conn_of(&pool)?;
      conn.transaction::<WorkflowDefinition, TxError, _>(|conn| {
        let next_version: i64 = dsl::workflow_definitions.filter(dsl::workflow_id.eq(&input.id))
                                                           .select(diesel::dsl::max(dsl::version))
                                                           .first::<Option<i64>>(conn)?
                                                           .unwrap_or(0)
          + 1;
        let def = WorkflowDefinition { id: input.id,
                                        version: next_version,
                                        name: input.name,
                                        description: input.description,
                                        category: input.category,
                                        steps: input.steps,
                                        entry_points: input.entry_points,
                                        exit_points: input.exit_points,
                                        ai_configurable: input.ai_configurable };
        let row = WorkflowDefinitionRow::from_definition(&def)?;
        diesel::insert_into(schema::workflow_definitions::table).values(&row).execute(conn)?;
        Ok(def)
      })
      .map_err(EngineError::from)
    }).await
  }

  async fn get(&self, workflow_id: &str, version: Option<i64>) -> Result<WorkflowDefinition> {
    let pool = self.pool.clone();
    let workflow_id = workflow_id.to_string();
    blocking(move || {
      use schema::workflow_definitions::dsl;
      let mut conn = conn_of(&pool)?;
      let row: Option<WorkflowDefinitionRow> = match version {
        Some(v) => map_db_err(dsl::workflow_definitions.filter(dsl::workflow_id.eq(&workflow_id))
                                                         .filter(dsl::version.eq(v))
                                                         .first(&mut conn)
                                                         .optional())?,
        None => map_db_err(dsl::workflow_definitions.filter(dsl::workflow_id.eq(&workflow_id))
                                                      .order(dsl::version.desc())
                                                      .first(&mut conn)
                                                      .optional())?,
      };
      let row = row.ok_or_else(|| EngineError::NotFound(format!("workflow {workflow_id}")))?;
      row.into_definition()
    }).await
  }

  async fn list(&self, category: Option<&str>) -> Result<Vec<WorkflowSummary>> {
    let pool = self.pool.clone();
    let category = category.map(|s| s.to_string());
    blocking(move || {
      use schema::workflow_definitions::dsl;
      let mut conn = conn_of(&pool)?;
      let rows: Vec<WorkflowDefinitionRow> = map_db_err(dsl::workflow_definitions.load(&mut conn))?;
      let mut latest: HashMap<String, WorkflowDefinitionRow> = HashMap::new();
      for row in rows {
        latest.entry(row.workflow_id.clone())
              .and_modify(|existing| {
                if row.version > existing.version {
                  *existing = clone_row(&row);
                }
              })
              .or_insert_with(|| clone_row(&row));
      }
      let mut out = Vec::new();
      for row in latest.into_values() {
        if category.as_deref().map(|c| c == row.category).unwrap_or(true) {
          let def = row.into_definition()?;
          out.push(WorkflowSummary::from(&def));
        }
      }
      out.sort_by(|a, b| a.id.cmp(&b.id));
      Ok(out)
    }).await
  }
}

fn clone_row(row: &WorkflowDefinitionRow) -> WorkflowDefinitionRow {
  WorkflowDefinitionRow { workflow_id: row.workflow_id.clone(),
                          version: row.version,
                          name: row.name.clone(),
                          description: row.description.clone(),
                          category: row.category.clone(),
                          steps_json: row.steps_json.clone(),
                          entry_points_json: row.entry_points_json.clone(),
                          exit_points_json: row.exit_points_json.clone(),
                          ai_configurable: row.ai_configurable }
}

// --- workflow_executions / step_executions --------------------------------

#[derive(Debug, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = schema::workflow_executions)]
struct WorkflowExecutionRow {
  execution_id: String,
  workflow_id: String,
  workflow_version: i64,
  principal_id: String,
  session_id: String,
  status: String,
  current_steps_json: String,
  started_at_ms: i64,
  updated_at_ms: i64,
  completed_at_ms: Option<i64>,
  error_json: Option<String>,
}

fn status_to_str(status: ExecutionStatus) -> &'static str {
  match status {
    ExecutionStatus::Pending => "PENDING",
    ExecutionStatus::Running => "RUNNING",
    ExecutionStatus::Paused => "PAUSED",
    ExecutionStatus::Completed => "COMPLETED",
    ExecutionStatus::Failed => "FAILED",
    ExecutionStatus::Cancelled => "CANCELLED",
  }
}

fn status_from_str(s: &str) -> Result<ExecutionStatus> {
  Ok(match s {
    "PENDING" => ExecutionStatus::Pending,
    "RUNNING" => ExecutionStatus::Running,
    "PAUSED" => ExecutionStatus::Paused,
    "COMPLETED" => ExecutionStatus::Completed,
    "FAILED" => ExecutionStatus::Failed,
    "CANCELLED" => ExecutionStatus::Cancelled,
    other => return Err(EngineError::Internal(format!("unknown execution status {other}"))),
  })
}

fn step_status_to_str(status: StepStatus) -> &'static str {
  match status {
    StepStatus::Pending => "PENDING",
    StepStatus::Running => "RUNNING",
    StepStatus::AwaitingInput => "AWAITING_INPUT",
    StepStatus::Completed => "COMPLETED",
    StepStatus::Failed => "FAILED",
    StepStatus::Skipped => "SKIPPED",
  }
}

fn step_status_from_str(s: &str) -> Result<StepStatus> {
  Ok(match s {
    "PENDING" => StepStatus::Pending,
    "RUNNING" => StepStatus::Running,
    "AWAITING_INPUT" => StepStatus::AwaitingInput,
    "COMPLETED" => StepStatus::Completed,
    "FAILED" => StepStatus::Failed,
    "SKIPPED" => StepStatus::Skipped,
    other => return Err(EngineError::Internal(format!("unknown step status {other}"))),
  })
}

impl WorkflowExecutionRow {
  fn from_execution(e: &WorkflowExecution) -> Result<Self> {
    Ok(Self { execution_id: e.execution_id.to_string(),
              workflow_id: e.workflow_id.clone(),
              workflow_version: e.workflow_version,
              principal_id: e.principal_id.clone(),
              session_id: e.session_id.clone(),
              status: status_to_str(e.status).to_string(),
              current_steps_json: to_json(&e.current_steps)?,
              started_at_ms: ms_of(e.started_at),
              updated_at_ms: ms_of(e.updated_at),
              completed_at_ms: e.completed_at.map(ms_of),
              error_json: e.error.as_ref().map(to_json).transpose()? })
  }

  fn into_execution(self) -> Result<WorkflowExecution> {
    Ok(WorkflowExecution { execution_id: Uuid::parse_str(&self.execution_id)
                                            .map_err(|e| EngineError::Internal(format!("invalid uuid: {e}")))?,
                            workflow_id: self.workflow_id,
                            workflow_version: self.workflow_version,
                            principal_id: self.principal_id,
                            session_id: self.session_id,
                            status: status_from_str(&self.status)?,
                            current_steps: from_json(&self.current_steps_json)?,
                            started_at: dt_of(self.started_at_ms),
                            updated_at: dt_of(self.updated_at_ms),
                            completed_at: self.completed_at_ms.map(dt_of),
                            error: self.error_json.as_deref().map(from_json).transpose()? })
  }
}

#[derive(Debug, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = schema::step_executions)]
struct StepExecutionRow {
  execution_id: String,
  step_id: String,
  status: String,
  attempt: i32,
  started_at_ms: Option<i64>,
  finished_at_ms: Option<i64>,
  duration_ms: Option<i64>,
  input_snapshot_json: String,
  output_json: Option<String>,
  error_json: Option<String>,
}

impl StepExecutionRow {
  fn from_step(s: &StepExecution) -> Result<Self> {
    Ok(Self { execution_id: s.execution_id.to_string(),
              step_id: s.step_id.clone(),
              status: step_status_to_str(s.status).to_string(),
              attempt: s.attempt as i32,
              started_at_ms: s.started_at.map(ms_of),
              finished_at_ms: s.finished_at.map(ms_of),
              duration_ms: s.duration_ms,
              input_snapshot_json: to_json(&s.input_snapshot)?,
              output_json: s.output.as_ref().map(to_json).transpose()?,
              error_json: s.error.as_ref().map(to_json).transpose()? })
  }

  fn into_step(self) -> Result<StepExecution> {
    Ok(StepExecution { execution_id: Uuid::parse_str(&self.execution_id)
                                       .map_err(|e| EngineError::Internal(format!("invalid uuid: {e}")))?,
                        step_id: self.step_id,
                        status: step_status_from_str(&self.status)?,
                        attempt: self.attempt as u32,
                        started_at: self.started_at_ms.map(dt_of),
                        finished_at: self.finished_at_ms.map(dt_of),
                        duration_ms: self.duration_ms,
                        input_snapshot: from_json(&self.input_snapshot_json)?,
                        output: self.output_json.as_deref().map(from_json).transpose()?,
                        error: self.error_json.as_deref().map(from_json).transpose()? })
  }
}

/// Diesel-backed `ExecutionRepository`.
pub struct DieselExecutionRepository {
  pool: Arc<DbPool>,
}

#[async_trait]
impl ExecutionRepository for DieselExecutionRepository {
  async fn insert_execution(&self, execution: WorkflowExecution) -> Result<()> {
    let pool = self.pool.clone();
    blocking(move || {
      let row = WorkflowExecutionRow::from_execution(&execution)?;
      let mut conn = conn_of(&pool)?;
      map_db_err(diesel::insert_into(schema::workflow_executions::table).values(&row).execute(&mut conn))?;
      Ok(())
    }).await
  }

  async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution> {
    let pool = self.pool.clone();
    blocking(move || {
      use schema::workflow_executions::dsl;
      let mut conn = conn_of(&pool)?;
      let row: Option<WorkflowExecutionRow> =
        map_db_err(dsl::workflow_executions.filter(dsl::execution_id.eq(execution_id.to_string()))
                                            .first(&mut conn)
                                            .optional())?;
      row.ok_or_else(|| EngineError::NotFound(format!("execution {execution_id}")))?.into_execution()
    }).await
  }

  async fn update_execution(&self, execution: WorkflowExecution) -> Result<()> {
    let pool = self.pool.clone();
    blocking(move || {
      use schema::workflow_executions::dsl;
      let mut conn = conn_of(&pool)?;
      conn.transaction::<(), TxError, _>(|conn| {
        let existing: Option<WorkflowExecutionRow> =
          dsl::workflow_executions.filter(dsl::execution_id.eq(execution.execution_id.to_string()))
                                   .first(conn)
                                   .optional()?;
        let existing = existing.ok_or_else(|| {
                         TxError::Engine(EngineError::NotFound(format!("execution {}", execution.execution_id)))
                       })?;
        let from = status_from_str(&existing.status)?;
        if from.is_terminal() && from != execution.status {
          return Err(TxError::Engine(EngineError::TerminalState(format!("execution {} already {from:?}",
                                                                          execution.execution_id))));
        }
        if !is_valid_transition(from, execution.status) {
          return Err(TxError::Engine(EngineError::Internal(format!("illegal execution transition {from:?} -> {:?}",
                                                                     execution.status))));
        }
        let row = WorkflowExecutionRow::from_execution(&execution)?;
        diesel::update(dsl::workflow_executions.filter(dsl::execution_id.eq(row.execution_id.clone()))).set(&row)
                                                                                                        .execute(conn)?;
        Ok(())
      })
      .map_err(EngineError::from)
    }).await
  }

  async fn list_executions(&self, principal_id: &str, pagination: Pagination) -> Result<Page<WorkflowExecution>> {
    let pool = self.pool.clone();
    let principal_id = principal_id.to_string();
    blocking(move || {
      use schema::workflow_executions::dsl;
      let mut conn = conn_of(&pool)?;
      let total: i64 = map_db_err(dsl::workflow_executions.filter(dsl::principal_id.eq(&principal_id))
                                                            .count()
                                                            .get_result(&mut conn))?;
      let rows: Vec<WorkflowExecutionRow> =
        map_db_err(dsl::workflow_executions.filter(dsl::principal_id.eq(&principal_id))
                                            .order(dsl::started_at_ms.desc())
                                            .offset((pagination.page as i64) * (pagination.page_size as i64))
                                            .limit(pagination.page_size as i64)
                                            .load(&mut conn))?;
      let mut items = Vec::with_capacity(rows.len());
      for row in rows {
        items.push(row.into_execution()?);
      }
      Ok(Page { items, total: total as usize, page: pagination.page })
    }).await
  }

  async fn upsert_step_execution(&self, step: StepExecution) -> Result<()> {
    let pool = self.pool.clone();
    blocking(move || {
      let row = StepExecutionRow::from_step(&step)?;
      let mut conn = conn_of(&pool)?;
      #[cfg(all(feature = "pg", not(test)))]
      {
        use schema::step_executions::dsl;
        map_db_err(diesel::insert_into(schema::step_executions::table).values(&row)
                     .on_conflict((dsl::execution_id, dsl::step_id))
                     .do_update()
                     .set(&row)
                     .execute(&mut conn))?;
      }
      #[cfg(any(test, not(feature = "pg")))]
      {
        map_db_err(diesel::replace_into(schema::step_executions::table).values(&row).execute(&mut conn))?;
      }
      Ok(())
    }).await
  }

  async fn get_step_execution(&self, execution_id: Uuid, step_id: &str) -> Result<Option<StepExecution>> {
    let pool = self.pool.clone();
    let step_id = step_id.to_string();
    blocking(move || {
      use schema::step_executions::dsl;
      let mut conn = conn_of(&pool)?;
      let row: Option<StepExecutionRow> =
        map_db_err(dsl::step_executions.filter(dsl::execution_id.eq(execution_id.to_string()))
                                       .filter(dsl::step_id.eq(&step_id))
                                       .first(&mut conn)
                                       .optional())?;
      row.map(|r| r.into_step()).transpose()
    }).await
  }

  async fn list_step_executions(&self, execution_id: Uuid) -> Result<Vec<StepExecution>> {
    let pool = self.pool.clone();
    blocking(move || {
      use schema::step_executions::dsl;
      let mut conn = conn_of(&pool)?;
      let rows: Vec<StepExecutionRow> =
        map_db_err(dsl::step_executions.filter(dsl::execution_id.eq(execution_id.to_string())).load(&mut conn))?;
      rows.into_iter().map(|r| r.into_step()).collect()
    }).await
  }

  async fn list_terminal_before(&self, horizon: DateTime<Utc>) -> Result<Vec<Uuid>> {
    let pool = self.pool.clone();
    let horizon_ms = ms_of(horizon);
    blocking(move || {
      use schema::workflow_executions::dsl;
      let mut conn = conn_of(&pool)?;
      let ids: Vec<String> =
        map_db_err(dsl::workflow_executions.filter(dsl::completed_at_ms.is_not_null())
                                            .filter(dsl::completed_at_ms.lt(horizon_ms))
                                            .select(dsl::execution_id)
                                            .load(&mut conn))?;
      ids.into_iter()
         .map(|id| Uuid::parse_str(&id).map_err(|e| EngineError::Internal(format!("invalid uuid: {e}"))))
         .collect()
    }).await
  }

  async fn delete_execution(&self, execution_id: Uuid) -> Result<()> {
    let pool = self.pool.clone();
    blocking(move || {
      let mut conn = conn_of(&pool)?;
      conn.transaction::<(), DieselError, _>(|conn| {
            use schema::step_executions::dsl as steps_dsl;
            use schema::workflow_executions::dsl as exec_dsl;
            diesel::delete(steps_dsl::step_executions.filter(steps_dsl::execution_id.eq(execution_id.to_string())))
              .execute(conn)?;
            diesel::delete(exec_dsl::workflow_executions.filter(exec_dsl::execution_id.eq(execution_id.to_string())))
              .execute(conn)?;
            Ok(())
          })
          .map_err(|e: DieselError| EngineError::Storage(format!("db: {e}")))
    }).await
  }
}

// --- context_commits -------------------------------------------------------

#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = schema::context_commits)]
struct ContextCommitRow {
  id: String,
  execution_id: String,
  version: i64,
  step_id: String,
  delta_json: String,
  committed_at_ms: i64,
}

impl ContextCommitRow {
  fn into_commit(self) -> Result<ContextCommit> {
    Ok(ContextCommit { id: Uuid::parse_str(&self.id).map_err(|e| EngineError::Internal(format!("invalid uuid: {e}")))?,
                        execution_id: Uuid::parse_str(&self.execution_id)
                                        .map_err(|e| EngineError::Internal(format!("invalid uuid: {e}")))?,
                        version: self.version,
                        step_id: self.step_id,
                        delta: from_json(&self.delta_json)?,
                        committed_at: dt_of(self.committed_at_ms) })
  }
}

/// Diesel-backed `ContextStore`. Optimistic concurrency is enforced inside
/// a single DB transaction: the current max version for `execution_id` is
/// read and compared to `expected_version` before the new row is inserted,
/// mirroring `InMemoryContextStore::commit`'s check-then-append.
pub struct DieselContextStore {
  pool: Arc<DbPool>,
}

#[async_trait]
impl ContextStore for DieselContextStore {
  async fn snapshot(&self, execution_id: Uuid) -> Result<ContextSnapshot> {
    let pool = self.pool.clone();
    blocking(move || {
      use schema::context_commits::dsl;
      let mut conn = conn_of(&pool)?;
      let rows: Vec<ContextCommitRow> =
        map_db_err(dsl::context_commits.filter(dsl::execution_id.eq(execution_id.to_string()))
                                       .order(dsl::version.asc())
                                       .load(&mut conn))?;
      let mut data: IndexMap<String, ContextValue> = IndexMap::new();
      let mut version = 0i64;
      for row in rows {
        let commit = row.into_commit()?;
        for (k, v) in commit.delta {
          data.insert(k, v);
        }
        version = commit.version;
      }
      Ok(ContextSnapshot { data, version })
    }).await
  }

  async fn commit(&self,
                   execution_id: Uuid,
                   step_id: &str,
                   delta: IndexMap<String, ContextValue>,
                   expected_version: i64)
                   -> Result<PersistResult> {
    let pool = self.pool.clone();
    let step_id = step_id.to_string();
    blocking(move || {
      use schema::context_commits::dsl;
      let mut conn = conn_of(&pool)?;
      conn.transaction::<PersistResult, TxError, _>(|conn| {
        let current_version: i64 =
          dsl::context_commits.filter(dsl::execution_id.eq(execution_id.to_string()))
                               .select(diesel::dsl::max(dsl::version))
                               .first::<Option<i64>>(conn)?
                               .unwrap_or(0);
        if current_version != expected_version {
          return Ok(PersistResult::Conflict);
        }
        let new_version = current_version + 1;
        let row = ContextCommitRow { id: Uuid::new_v4().to_string(),
                                      execution_id: execution_id.to_string(),
                                      version: new_version,
                                      step_id: step_id.clone(),
                                      delta_json: to_json(&delta)?,
                                      committed_at_ms: ms_of(Utc::now()) };
        diesel::insert_into(schema::context_commits::table).values(&row).execute(conn)?;
        Ok(PersistResult::Ok { new_version })
      })
      .map_err(EngineError::from)
    }).await
  }

  async fn history(&self, execution_id: Uuid) -> Result<Vec<ContextCommit>> {
    let pool = self.pool.clone();
    blocking(move || {
      use schema::context_commits::dsl;
      let mut conn = conn_of(&pool)?;
      let rows: Vec<ContextCommitRow> =
        map_db_err(dsl::context_commits.filter(dsl::execution_id.eq(execution_id.to_string()))
                                       .order(dsl::version.asc())
                                       .load(&mut conn))?;
      rows.into_iter().map(|r| r.into_commit()).collect()
    }).await
  }

  async fn purge(&self, execution_id: Uuid) -> Result<()> {
    let pool = self.pool.clone();
    blocking(move || {
      use schema::context_commits::dsl;
      let mut conn = conn_of(&pool)?;
      map_db_err(diesel::delete(dsl::context_commits.filter(dsl::execution_id.eq(execution_id.to_string()))).execute(&mut conn))?;
      Ok(())
    }).await
  }
}
