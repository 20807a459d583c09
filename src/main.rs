//! Administrative CLI: `register-workflow`, `list-workflows`,
//! `start`, `status`, `cancel` against a live `workflow_runtime::Engine`,
//! replacing an interactive `io::stdin()` menu loop with `clap`
//! subcommands carrying stable exit codes (0 success, 1 client
//! error, 2 transport/engine error).
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use uuid::Uuid;

use boundary::wire::{ExecutionStatusView, StartExecutionRequest};
use boundary::{exit_code_for, EngineBoundary, EngineGateway};
use providers::{HttpAiProvider, HttpMarketDataProvider};
use step_library::StepLibrary;
use workflow_core::{
  ContextStore, ContextValue, EngineErrorCode, ExecutionRepository, InMemoryContextStore, InMemoryExecutionRepository,
  InMemoryWorkflowRegistry, Pagination, WorkflowDefinitionInput, WorkflowRegistry,
};
use workflow_runtime::{Engine, EngineOptions};

#[derive(Parser)]
#[command(name = "workflow-engine", about = "Administrative CLI for the workflow execution engine")]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Register a workflow definition from a JSON file.
  RegisterWorkflow {
    file: PathBuf,
  },
  /// List the latest version of every registered workflow.
  ListWorkflows {
    #[arg(long)]
    category: Option<String>,
  },
  /// Start an execution of `workflow_id` seeded with `context.json`.
  Start {
    workflow_id: String,
    context_file: PathBuf,
    #[arg(long)]
    version: Option<i64>,
    #[arg(long, default_value = "cli-user")]
    principal: String,
    #[arg(long)]
    session: Option<String>,
  },
  /// Print the current status of an execution.
  Status {
    execution_id: Uuid,
  },
  /// Request cancellation of a running execution.
  Cancel {
    execution_id: Uuid,
  },
}

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
  dotenvy::dotenv().ok();

  let cli = Cli::parse();
  match run(cli.command).await {
    Ok(()) => ExitCode::from(0),
    Err(CliError::Client(msg)) => {
      eprintln!("error: {msg}");
      ExitCode::from(1)
    }
    Err(CliError::Engine(code, msg)) => {
      eprintln!("error: {msg}");
      ExitCode::from(exit_code_for(code) as u8)
    }
  }
}

enum CliError {
  /// Malformed CLI input (bad JSON, missing file) — never reaches the engine.
  Client(String),
  Engine(EngineErrorCode, String),
}

impl From<boundary::wire::ErrorEnvelope> for CliError {
  fn from(e: boundary::wire::ErrorEnvelope) -> Self {
    CliError::Engine(e.code, e.message)
  }
}

async fn run(command: Command) -> Result<(), CliError> {
  let gateway = build_gateway();

  match command {
    Command::RegisterWorkflow { file } => {
      let raw = std::fs::read_to_string(&file)
        .map_err(|e| CliError::Client(format!("reading {}: {e}", file.display())))?;
      let input: WorkflowDefinitionInput =
        serde_json::from_str(&raw).map_err(|e| CliError::Client(format!("parsing {}: {e}", file.display())))?;
      let (id, version) = gateway.register_workflow(input).await?;
      println!("registered {id} v{version}");
      Ok(())
    }
    Command::ListWorkflows { category } => {
      let page = gateway.list_workflows(category.as_deref(), Pagination::default()).await?;
      for summary in page.items {
        println!("{}\tv{}\t{}\t{}", summary.id, summary.version, summary.category, summary.name);
      }
      Ok(())
    }
    Command::Start { workflow_id, context_file, version, principal, session } => {
      let raw = std::fs::read_to_string(&context_file)
        .map_err(|e| CliError::Client(format!("reading {}: {e}", context_file.display())))?;
      let parsed: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| CliError::Client(format!("parsing {}: {e}", context_file.display())))?;
      let object = parsed.as_object().cloned().ok_or_else(|| {
                     CliError::Client(format!("{} must contain a JSON object", context_file.display()))
                   })?;
      let mut data: IndexMap<String, ContextValue> = IndexMap::new();
      for (key, value) in object {
        data.insert(key, ContextValue::from_plain_json(value));
      }
      let response = gateway.start_execution(StartExecutionRequest {
                                workflow_id,
                                version,
                                principal_id: principal,
                                session_id: session.unwrap_or_else(|| Uuid::new_v4().to_string()),
                                initial_context: boundary::wire::ContextPayload { data },
                                options: None,
                              })
                              .await?;
      println!("{}", response.execution_id);
      Ok(())
    }
    Command::Status { execution_id } => {
      let view: ExecutionStatusView = gateway.get_execution(execution_id).await?;
      println!("execution_id: {}", view.execution_id);
      println!("workflow:     {} v{}", view.workflow_id, view.workflow_version);
      println!("status:       {:?}", view.status);
      println!("version:      {}", view.version);
      for step in &view.current_steps {
        println!("  {:<24} {:?}", step.step_id, step.status);
      }
      if let Some(error) = &view.error {
        println!("error:        [{:?}] {}", error.code, error.message);
      }
      Ok(())
    }
    Command::Cancel { execution_id } => {
      gateway.cancel(execution_id).await?;
      println!("cancellation requested for {execution_id}");
      Ok(())
    }
  }
}

/// Wires a live `EngineGateway` from the environment: `WORKFLOW_DB_URL` (or
/// `DATABASE_URL`) selects the Diesel-backed stores, otherwise the engine
/// runs entirely in memory for the lifetime of this process — adequate for
/// `register-workflow`+`start` in one invocation, not for `status`/`cancel`
/// against a prior run.
fn build_gateway() -> EngineGateway {
  let library = Arc::new(StepLibrary::new());

  let (context_store, executions, registry): (Arc<dyn ContextStore>, Arc<dyn ExecutionRepository>, Arc<dyn WorkflowRegistry>) =
    match persistence::new_from_env() {
      Ok((ctx, exec, reg)) => {
        (Arc::new(ctx), Arc::new(exec), Arc::new(reg.with_config_validator(library.config_validator())))
      }
      Err(_) => {
        tracing::info!("WORKFLOW_DB_URL/DATABASE_URL not set; running against in-memory stores");
        (Arc::new(InMemoryContextStore::new()),
         Arc::new(InMemoryExecutionRepository::new()),
         Arc::new(InMemoryWorkflowRegistry::new().with_config_validator(library.config_validator())))
      }
    };

  let engine = Engine::new(registry,
                            context_store,
                            executions,
                            library,
                            Arc::new(HttpMarketDataProvider::new_from_env()),
                            Arc::new(HttpAiProvider::new_from_env()),
                            EngineOptions::default());
  EngineGateway::new(engine)
}
