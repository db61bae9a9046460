//! Task values and execution results.
//!
//! A [`Task`] is immutable once planned: every transition returns a new value
//! with a higher `version`, which is what the reducers in [`crate::state`] use
//! to detect stale or replayed updates.
//!
//! # Example
//!
//! ```rust
//! use weave_engine::task::{Task, TaskStatus};
//!
//! let fetch = Task::new("fetch", "http_get").with_priority(5);
//! let parse = Task::new("parse", "json_parse").depends_on("fetch");
//!
//! let started = fetch.started();
//! assert_eq!(started.status, TaskStatus::InProgress);
//! assert_eq!(started.version, fetch.version + 1);
//! assert!(parse.depends_on.contains(&"fetch".into()));
//! ```

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque key-value map passed to executors and returned by them.
pub type Parameters = Map<String, Value>;

/// Unique identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a new task ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies or for a dispatch slot.
    #[default]
    Pending,
    /// A dependency ended without success; not re-evaluated automatically.
    Blocked,
    /// Handed to an executor.
    InProgress,
    /// Held at a declared interrupt point until a human responds.
    NeedsApproval,
    /// Task completed successfully.
    Completed,
    /// Task failed after exhausting its retries.
    Failed,
    /// Task was skipped (e.g., rejected by a reviewer).
    Skipped,
    /// Task was cancelled.
    Cancelled,
}

impl TaskStatus {
    /// Check if task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }

    /// Check if task completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }

    /// Terminal without success; dependents of such a task can never run.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }
}

/// Kind of human interaction declared on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    /// A reviewer must approve before the task runs.
    Approval,
    /// The task needs a clarifying answer before it runs.
    Clarification,
    /// The task needs a value supplied by a human.
    Input,
}

/// Interrupt point declared by the planner on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptPoint {
    /// Kind of interaction requested.
    pub kind: InterruptKind,
    /// Text shown to the human.
    #[serde(default)]
    pub prompt: String,
    /// Parameter key that receives a provided value.
    #[serde(default = "default_input_key")]
    pub input_key: String,
}

fn initial_version() -> u64 {
    1
}

fn default_input_key() -> String {
    "human_input".to_string()
}

impl InterruptPoint {
    /// Create a new interrupt point.
    pub fn new(kind: InterruptKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
            input_key: default_input_key(),
        }
    }

    /// Store the provided value under a different parameter key.
    pub fn with_input_key(mut self, key: impl Into<String>) -> Self {
        self.input_key = key.into();
        self
    }
}

/// Loop-until-condition metadata that selects the cyclic strategy.
///
/// After each successful run the task's result field `field` is compared with
/// `equals`; on mismatch the task is queued again until `max_iterations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    /// Result field inspected after each iteration.
    pub field: String,
    /// Value that ends the loop.
    pub equals: Value,
    /// Upper bound on iterations, including the first run.
    pub max_iterations: u32,
}

impl LoopSpec {
    /// Create a loop specification.
    pub fn until(field: impl Into<String>, equals: Value, max_iterations: u32) -> Self {
        Self {
            field: field.into(),
            equals,
            max_iterations: max_iterations.max(1),
        }
    }

    /// Check whether a result satisfies the exit condition.
    pub fn is_satisfied(&self, data: &Parameters) -> bool {
        data.get(&self.field) == Some(&self.equals)
    }
}

/// A single unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier, unique within a plan.
    pub id: TaskId,
    /// Name of the executor that runs this task.
    pub tool: String,
    /// Parameters handed to the executor.
    #[serde(default)]
    pub parameters: Parameters,
    /// Priority (higher = dispatched first).
    #[serde(default)]
    pub priority: i32,
    /// Tasks that must complete before this one is eligible.
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,
    /// Current status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Output, set only on `Completed`.
    #[serde(default)]
    pub result: Option<Parameters>,
    /// Error message, set only on `Failed`.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Attempts already retried.
    #[serde(default)]
    pub retry_count: u32,
    /// Retries allowed before the task fails.
    #[serde(default)]
    pub max_retries: u32,
    /// Bumped on every transition.
    #[serde(default = "initial_version")]
    pub version: u64,
    /// Declared human interaction before the task runs.
    #[serde(default)]
    pub interrupt: Option<InterruptPoint>,
    /// Whether the declared interrupt has been answered.
    #[serde(default)]
    pub interrupt_cleared: bool,
    /// Cyclic execution metadata.
    #[serde(default)]
    pub loop_spec: Option<LoopSpec>,
    /// Completed loop iterations.
    #[serde(default)]
    pub iteration: u32,
}

impl Task {
    /// Create a new pending task.
    pub fn new(id: impl Into<TaskId>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            parameters: Parameters::new(),
            priority: 0,
            depends_on: BTreeSet::new(),
            status: TaskStatus::Pending,
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: 0,
            version: initial_version(),
            interrupt: None,
            interrupt_cleared: false,
            loop_spec: None,
            iteration: 0,
        }
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a dependency.
    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Add a parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Declare an interrupt point before the task runs.
    pub fn with_interrupt(mut self, interrupt: InterruptPoint) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Mark the task as cyclic.
    pub fn with_loop(mut self, spec: LoopSpec) -> Self {
        self.loop_spec = Some(spec);
        self
    }

    /// Whether the task must wait for a human before dispatch.
    pub fn needs_human(&self) -> bool {
        self.interrupt.is_some() && !self.interrupt_cleared
    }

    /// Whether two values describe the same work.
    pub fn same_definition(&self, other: &Task) -> bool {
        self.tool == other.tool
            && self.parameters == other.parameters
            && self.priority == other.priority
            && self.depends_on == other.depends_on
            && self.max_retries == other.max_retries
            && self.interrupt == other.interrupt
            && self.loop_spec == other.loop_spec
    }

    /// Copy the definition of `def` onto this runtime value, keeping progress.
    ///
    /// A blocked task is re-queued since its dependencies may have changed.
    pub fn redefined_from(&self, def: &Task) -> Self {
        let mut next = self.clone();
        next.tool = def.tool.clone();
        next.parameters = def.parameters.clone();
        next.priority = def.priority;
        next.depends_on = def.depends_on.clone();
        next.max_retries = def.max_retries;
        next.interrupt = def.interrupt.clone();
        next.loop_spec = def.loop_spec.clone();
        if next.status == TaskStatus::Blocked {
            next.status = TaskStatus::Pending;
        }
        next.version += 1;
        next
    }

    /// Copy with a new status and a bumped version.
    pub fn with_status(&self, status: TaskStatus) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.version += 1;
        next
    }

    /// Transition to `InProgress`.
    pub fn started(&self) -> Self {
        self.with_status(TaskStatus::InProgress)
    }

    /// Transition to `Completed` with its output.
    pub fn completed(&self, result: Parameters) -> Self {
        let mut next = self.with_status(TaskStatus::Completed);
        next.result = Some(result);
        next.error_message = None;
        next
    }

    /// Transition to `Failed`.
    pub fn failed(&self, error: impl Into<String>) -> Self {
        let mut next = self.with_status(TaskStatus::Failed);
        next.error_message = Some(error.into());
        next.result = None;
        next
    }

    /// Back to `Pending` for another attempt.
    pub fn requeued_for_retry(&self) -> Self {
        let mut next = self.with_status(TaskStatus::Pending);
        next.retry_count += 1;
        next
    }

    /// Back to `Pending` for the next loop iteration.
    pub fn next_iteration(&self) -> Self {
        let mut next = self.with_status(TaskStatus::Pending);
        next.iteration += 1;
        next.retry_count = 0;
        next
    }

    /// Record the finished iteration of a loop that is done.
    pub fn completed_iteration(&self, result: Parameters) -> Self {
        let mut next = self.completed(result);
        next.iteration += 1;
        next
    }

    /// Transition to `Blocked`.
    pub fn blocked(&self) -> Self {
        self.with_status(TaskStatus::Blocked)
    }

    /// Transition to `Cancelled`.
    pub fn cancelled(&self) -> Self {
        self.with_status(TaskStatus::Cancelled)
    }

    /// Transition to `Skipped`.
    pub fn skipped(&self) -> Self {
        self.with_status(TaskStatus::Skipped)
    }

    /// Transition to `NeedsApproval`.
    pub fn awaiting_approval(&self) -> Self {
        self.with_status(TaskStatus::NeedsApproval)
    }

    /// Back to `Pending` with the interrupt answered.
    pub fn cleared_interrupt(&self) -> Self {
        let mut next = self.with_status(TaskStatus::Pending);
        next.interrupt_cleared = true;
        next
    }

    /// Back to `Pending` with the interrupt answered by a value.
    pub fn with_human_input(&self, value: Value) -> Self {
        let mut next = self.cleared_interrupt();
        let key = next
            .interrupt
            .as_ref()
            .map(|i| i.input_key.clone())
            .unwrap_or_else(default_input_key);
        next.parameters.insert(key, value);
        next
    }
}

/// Outcome of a single executor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Output data.
    #[serde(default)]
    pub data: Parameters,
    /// Error message if failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock duration of the invocation.
    #[serde(default)]
    pub execution_time_ms: u64,
    /// When the invocation finished.
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Successful result.
    pub fn success(data: Parameters) -> Self {
        Self {
            success: true,
            data,
            error: None,
            execution_time_ms: 0,
            completed_at: Utc::now(),
        }
    }

    /// Failed result.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Parameters::new(),
            error: Some(error.into()),
            execution_time_ms: 0,
            completed_at: Utc::now(),
        }
    }

    /// Failure produced when an invocation exceeds its timeout.
    pub fn timed_out(timeout: std::time::Duration) -> Self {
        Self::failure(format!("Task timed out after {:?}", timeout))
    }

    /// Set the measured duration.
    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.execution_time_ms = duration.as_millis() as u64;
        self
    }

    /// Override the completion timestamp.
    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = at;
        self
    }
}
