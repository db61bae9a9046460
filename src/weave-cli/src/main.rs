//! Weave - command-line runner for task plans.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use weave_engine::{
    CheckpointGateway, DependencyGraph, EngineConfig, ExecutionContext, ExecutionResult, Executor,
    ExecutorRegistry, FileCheckpointStore, HitlAction, HitlRequest, HitlRequestType,
    InMemoryCheckpointStore, Orchestrator, Session, SessionStatus, Task, plan_from_json,
};

/// Weave task-graph runner
#[derive(Parser)]
#[command(name = "weave")]
#[command(about = "Validate, order and run task plans")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "WEAVE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a plan file for structural errors.
    Validate {
        /// Plan file (`{"tasks": [...], "edges": {...}}`)
        plan: PathBuf,
    },
    /// Print the dispatch order of a plan.
    Order {
        /// Plan file
        plan: PathBuf,
    },
    /// Run a plan with the built-in echo executor.
    Run {
        /// Plan file
        plan: PathBuf,

        /// Approve every HITL request instead of stopping at the first one.
        #[arg(long)]
        auto_approve: bool,

        /// Value supplied to clarification and input requests with --auto-approve.
        #[arg(long, default_value = "yes")]
        answer: String,
    },
    /// Resume a checkpointed session.
    Resume {
        /// Session id
        session_id: String,

        /// Approve every HITL request instead of stopping at the first one.
        #[arg(long)]
        auto_approve: bool,

        /// Value supplied to clarification and input requests with --auto-approve.
        #[arg(long, default_value = "yes")]
        answer: String,
    },
    /// List checkpointed sessions.
    Sessions,
}

fn setup_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    }
}

/// Executor that returns its parameters, used to dry-run plans.
struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn invoke(&self, task: Task, ctx: ExecutionContext) -> ExecutionResult {
        let mut data = task.parameters.clone();
        data.insert("tool".to_string(), json!(task.tool));
        data.insert("attempt".to_string(), json!(ctx.attempt));
        ExecutionResult::success(data)
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn load_plan(path: &Path) -> anyhow::Result<(Vec<Task>, DependencyGraph)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan file {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Plan file {} is not valid JSON", path.display()))?;
    let plan = plan_from_json(value)
        .with_context(|| format!("Plan file {} does not describe a plan", path.display()))?;
    Ok(plan)
}

fn echo_registry(tools: impl IntoIterator<Item = String>) -> ExecutorRegistry {
    let echo: Arc<dyn Executor> = Arc::new(EchoExecutor);
    let mut registry = ExecutorRegistry::new();
    for tool in tools {
        registry.register(tool, echo.clone());
    }
    registry
}

fn checkpoint_store(config: &EngineConfig) -> Arc<dyn CheckpointGateway> {
    match &config.checkpoint_dir {
        Some(dir) => Arc::new(FileCheckpointStore::new(dir)),
        None => Arc::new(InMemoryCheckpointStore::new()),
    }
}

fn auto_response(request: &HitlRequest, answer: &str) -> HitlAction {
    match request.request_type {
        HitlRequestType::PlanReview | HitlRequestType::Approval => HitlAction::Approve,
        HitlRequestType::Clarification | HitlRequestType::Input => HitlAction::Provide {
            value: json!(answer),
        },
    }
}

fn exit_code_for(status: SessionStatus) -> ExitCode {
    match status {
        SessionStatus::Completed => ExitCode::SUCCESS,
        SessionStatus::AwaitingHuman | SessionStatus::Paused => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

fn print_session(session: &Session) -> anyhow::Result<()> {
    let tasks: Vec<Value> = session
        .execution_state
        .tasks_by_id
        .values()
        .map(|t| {
            json!({
                "id": t.id,
                "status": t.status,
                "retry_count": t.retry_count,
                "error": t.error_message,
            })
        })
        .collect();
    let summary = json!({
        "session_id": session.session_id,
        "status": session.status,
        "plan_version": session.plan.version,
        "pending_hitl": session.pending_hitl,
        "tasks": tasks,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn drive(
    engine: &Orchestrator,
    session_id: &str,
    auto_approve: bool,
    answer: &str,
) -> anyhow::Result<Session> {
    loop {
        let session = engine.run_until_settled(session_id).await?;
        let Some(request) = session.pending_hitl.clone() else {
            return Ok(session);
        };
        if !auto_approve || session.status.is_terminal() {
            warn!(
                session_id = %session_id,
                request_id = %request.request_id,
                request_type = %request.request_type,
                "Session is waiting for a human response"
            );
            return Ok(session);
        }

        info!(request_id = %request.request_id, "Auto-approving HITL request");
        engine
            .respond_to_hitl(session_id, &request.request_id, auto_response(&request, answer))
            .await?;
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Validate { plan } => {
            let (tasks, edges) = load_plan(&plan)?;
            let engine = Orchestrator::new(config, ExecutorRegistry::new(), scratch_store());
            let plan = engine.create_plan(tasks, &edges)?;
            println!("Plan is valid: {} tasks", plan.tasks.len());
            Ok(ExitCode::SUCCESS)
        }
        Command::Order { plan } => {
            let (tasks, edges) = load_plan(&plan)?;
            let engine = Orchestrator::new(config, ExecutorRegistry::new(), scratch_store());
            let plan = engine.create_plan(tasks, &edges)?;
            for (position, id) in plan.topological_order()?.iter().enumerate() {
                println!("{:>3}. {}", position + 1, id);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            plan,
            auto_approve,
            answer,
        } => {
            let (tasks, edges) = load_plan(&plan)?;
            let registry = echo_registry(tasks.iter().map(|t| t.tool.clone()));
            let store = checkpoint_store(&config);
            let engine = Orchestrator::new(config, registry, store);

            let plan = engine.create_plan(tasks, &edges)?;
            let session_id = engine.start_session(plan).await?;
            info!(session_id = %session_id, "Running plan");

            let session = drive(&engine, &session_id, auto_approve, &answer).await?;
            print_session(&session)?;
            Ok(exit_code_for(session.status))
        }
        Command::Resume {
            session_id,
            auto_approve,
            answer,
        } => {
            if config.checkpoint_dir.is_none() {
                bail!("Resuming requires checkpoint_dir (or WEAVE_CHECKPOINT_DIR) to be set");
            }
            let store = checkpoint_store(&config);
            let session = store
                .load(&session_id)
                .await?
                .with_context(|| format!("No checkpoint for session {}", session_id))?;
            let registry = echo_registry(session.plan.tasks.iter().map(|t| t.tool.clone()));

            let engine = Orchestrator::new(config, registry, store);
            engine.restore_session(&session_id).await?;
            if session.status == SessionStatus::Paused {
                engine.resume(&session_id).await?;
            }

            let session = drive(&engine, &session_id, auto_approve, &answer).await?;
            print_session(&session)?;
            Ok(exit_code_for(session.status))
        }
        Command::Sessions => {
            let Some(dir) = &config.checkpoint_dir else {
                bail!("Listing sessions requires checkpoint_dir (or WEAVE_CHECKPOINT_DIR) to be set");
            };
            let store = FileCheckpointStore::new(dir);
            for id in store.list().await? {
                match store.load(&id).await? {
                    Some(session) => println!("{}  {}", id, session.status),
                    None => println!("{}  (missing)", id),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Throwaway store for commands that never start a session.
fn scratch_store() -> Arc<dyn CheckpointGateway> {
    Arc::new(InMemoryCheckpointStore::new())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    setup_logging(&args.log_level, args.json_logs);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
