//! Executor bridge.
//!
//! The [`Dispatcher`] hands a task to the executor registered for its tool,
//! enforces the per-task timeout, honours cancellation and reports back with
//! a [`TaskCompletion`] over a channel. It never touches execution state; the
//! orchestrator folds completions in through the reducers.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = ExecutorRegistry::new().with("echo", Arc::new(EchoExecutor));
//! let dispatcher = Dispatcher::new(registry, Some(Duration::from_secs(30)));
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!
//! dispatcher.dispatch("session-1", task, IndexMap::new(), CancellationToken::new(), tx);
//! let completion = rx.recv().await.unwrap();
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::task::{ExecutionResult, Task, TaskId};

/// Context handed to an executor with each invocation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Session the task belongs to.
    pub session_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Loop iteration for cyclic tasks.
    pub iteration: u32,
    /// Cancelled when the session is cancelled.
    pub cancel: CancellationToken,
    /// Results of the task's direct dependencies.
    pub upstream_results: IndexMap<TaskId, ExecutionResult>,
}

/// A pluggable task executor.
///
/// Implementations should watch `ctx.cancel` when they can stop early. An
/// invocation that ignores it is allowed to finish; its result is discarded.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a task.
    async fn invoke(&self, task: Task, ctx: ExecutionContext) -> ExecutionResult;
}

/// Name to executor map, built by the caller and injected into the engine.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.executors.keys().collect();
        names.sort();
        f.debug_struct("ExecutorRegistry")
            .field("executors", &names)
            .finish()
    }
}

impl ExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for a tool name.
    pub fn register(&mut self, tool: impl Into<String>, executor: Arc<dyn Executor>) {
        self.executors.insert(tool.into(), executor);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, tool: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.register(tool, executor);
        self
    }

    /// Look up the executor for a tool.
    pub fn get(&self, tool: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(tool).cloned()
    }
}

/// Report of a finished invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    /// Version of the `InProgress` task that was dispatched.
    pub dispatched_version: u64,
    pub result: ExecutionResult,
    /// The invocation was interrupted by cancellation.
    pub cancelled: bool,
}

/// Sender half used by dispatched invocations.
pub type CompletionSender = mpsc::UnboundedSender<TaskCompletion>;

/// Spawns executor invocations.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: ExecutorRegistry,
    task_timeout: Option<Duration>,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(registry: ExecutorRegistry, task_timeout: Option<Duration>) -> Self {
        Self {
            registry,
            task_timeout,
        }
    }

    /// Spawn one invocation. `task` must be the `InProgress` value.
    pub fn dispatch(
        &self,
        session_id: &str,
        task: Task,
        upstream_results: IndexMap<TaskId, ExecutionResult>,
        cancel: CancellationToken,
        tx: CompletionSender,
    ) -> JoinHandle<()> {
        let executor = self.registry.get(&task.tool);
        let timeout = self.task_timeout;
        let ctx = ExecutionContext {
            session_id: session_id.to_string(),
            attempt: task.retry_count + 1,
            iteration: task.iteration,
            cancel: cancel.clone(),
            upstream_results,
        };
        let task_id = task.id.clone();
        let dispatched_version = task.version;

        tracing::debug!(
            session_id = %ctx.session_id,
            task_id = %task_id,
            tool = %task.tool,
            attempt = ctx.attempt,
            "Dispatching task"
        );

        tokio::spawn(async move {
            let start = Instant::now();
            let mut cancelled = false;

            let result = match executor {
                None => ExecutionResult::failure(format!(
                    "No executor registered for tool '{}'",
                    task.tool
                )),
                Some(executor) => {
                    let invocation = async {
                        match timeout {
                            Some(limit) => {
                                match tokio::time::timeout(limit, executor.invoke(task, ctx)).await {
                                    Ok(result) => result,
                                    Err(_) => ExecutionResult::timed_out(limit),
                                }
                            }
                            None => executor.invoke(task, ctx).await,
                        }
                    };

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            cancelled = true;
                            ExecutionResult::failure("Invocation cancelled")
                        }
                        result = invocation => result,
                    }
                }
            };

            let result = if result.execution_time_ms == 0 {
                result.with_duration(start.elapsed())
            } else {
                result
            };

            let completion = TaskCompletion {
                task_id,
                dispatched_version,
                result,
                cancelled,
            };
            if tx.send(completion).is_err() {
                tracing::debug!("Completion receiver dropped");
            }
        })
    }
}
