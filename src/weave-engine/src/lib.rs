//! Task-graph orchestration engine.
//!
//! Turns declared tasks into a dependency-respecting schedule, dispatches
//! ready work to pluggable executors, merges concurrently produced state
//! through pure reducers and suspends at human-in-the-loop points that
//! survive a restart through checkpoints.
//!
//! # Features
//!
//! - **Planning**: [`plan::create_plan`] builds a validated [`Plan`]; cycles,
//!   dangling and self dependencies are rejected before any state changes.
//! - **Scheduling**: the [`scheduler`] picks a Single, Sequential, Parallel or
//!   Cyclic strategy and a batch that respects the concurrency cap.
//! - **Reducers**: every write goes through [`state::StateStore::apply`], which
//!   is idempotent and never overwrites a terminal task with a stale update.
//! - **HITL**: plan reviews and per-task interrupts with explicit timeout
//!   defaults ([`hitl::TimeoutPolicy`]).
//! - **Checkpoints**: [`checkpoint::CheckpointGateway`] with in-memory and
//!   JSON file stores.
//!
//! # Task graph
//!
//! ```rust
//! use weave_engine::graph::ready_set;
//! use weave_engine::state::ExecutionState;
//! use weave_engine::{Plan, Task, TaskId};
//!
//! let plan = Plan::new(vec![
//!     Task::new("A", "echo"),
//!     Task::new("B", "echo").depends_on("A"),
//!     Task::new("C", "echo").depends_on("A"),
//!     Task::new("D", "echo").depends_on("B").depends_on("C"),
//! ])
//! .unwrap();
//!
//! let state = ExecutionState::from_tasks(plan.tasks.clone());
//! assert_eq!(ready_set(&state), vec![TaskId::from("A")]);
//! ```
//!
//! # Running a session
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use weave_engine::{EngineConfig, ExecutorRegistry, InMemoryCheckpointStore, Orchestrator};
//!
//! let executors = ExecutorRegistry::new().with("echo", Arc::new(EchoExecutor));
//! let engine = Orchestrator::new(
//!     EngineConfig::default(),
//!     executors,
//!     Arc::new(InMemoryCheckpointStore::new()),
//! );
//!
//! let plan = engine.create_plan(tasks, &DependencyGraph::new())?;
//! let session_id = engine.start_session(plan).await?;
//! let session = engine.run_until_settled(&session_id).await?;
//! ```

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hitl;
pub mod plan;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod task;

pub use checkpoint::{CheckpointGateway, FileCheckpointStore, InMemoryCheckpointStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use dispatcher::{Dispatcher, ExecutionContext, Executor, ExecutorRegistry, TaskCompletion};
pub use engine::{AdvanceOutcome, Orchestrator};
pub use error::{CheckpointError, ConfigError, EngineError, GraphError, HitlError, Result};
pub use graph::{TaskGraph, blocked_candidates, ready_set};
pub use hitl::{
    HitlAction, HitlController, HitlRequest, HitlRequestType, HitlStatus, HitlTimeouts,
    InstructionInterpreter, TimeoutAction, TimeoutPolicy,
};
pub use plan::{
    ChangeKind, ChangeLogEntry, DependencyGraph, Plan, PlanEdit, PlanStatus, create_plan,
    plan_from_json,
};
pub use scheduler::{ExecutionStrategy, Scheduler, SchedulerOutcome, decide_strategy};
pub use session::{Session, SessionStatus};
pub use state::{ExecutionState, StateStore, StateUpdate};
pub use task::{
    ExecutionResult, InterruptKind, InterruptPoint, LoopSpec, Parameters, Task, TaskId, TaskStatus,
};
