//! Execution strategy selection and batch scheduling.
//!
//! The scheduler is pure: it reads one [`ExecutionState`] snapshot and says
//! what to do next. It never waits for capacity; a saturated session gets an
//! empty batch and is re-evaluated after the next completion.
//!
//! # Example
//!
//! ```rust
//! use weave_engine::scheduler::{ExecutionStrategy, Scheduler, SchedulerOutcome};
//! use weave_engine::state::ExecutionState;
//! use weave_engine::task::Task;
//!
//! let state = ExecutionState::from_tasks(vec![
//!     Task::new("a", "echo"),
//!     Task::new("b", "echo"),
//!     Task::new("c", "echo").depends_on("a"),
//! ]);
//!
//! match Scheduler::new(Some(1)).evaluate(&state) {
//!     SchedulerOutcome::Dispatch { batch, strategy } => {
//!         assert_eq!(batch.len(), 1);
//!         assert_eq!(strategy, ExecutionStrategy::Parallel);
//!     }
//!     other => panic!("unexpected outcome: {:?}", other),
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::graph::ready_set;
use crate::state::ExecutionState;
use crate::task::{Task, TaskId, TaskStatus};

/// How the current ready work is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// The whole plan is one task.
    #[default]
    Single,
    /// One ready task at a time along a chain.
    Sequential,
    /// Several independent tasks at once.
    Parallel,
    /// A ready task loops until its condition holds.
    Cyclic,
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStrategy::Single => write!(f, "single"),
            ExecutionStrategy::Sequential => write!(f, "sequential"),
            ExecutionStrategy::Parallel => write!(f, "parallel"),
            ExecutionStrategy::Cyclic => write!(f, "cyclic"),
        }
    }
}

/// Strategy with the reason it was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyDecision {
    pub strategy: ExecutionStrategy,
    pub reason: String,
}

impl StrategyDecision {
    fn new(strategy: ExecutionStrategy, reason: impl Into<String>) -> Self {
        Self {
            strategy,
            reason: reason.into(),
        }
    }
}

/// Pick a strategy for the current snapshot.
///
/// Cyclic is only chosen when a ready task declares loop metadata; it is
/// never inferred from the graph shape.
pub fn decide_strategy(state: &ExecutionState) -> StrategyDecision {
    let ready = ready_set(state);

    if let Some(id) = ready
        .iter()
        .find(|id| state.task(id).is_some_and(|t| t.loop_spec.is_some()))
    {
        return StrategyDecision::new(
            ExecutionStrategy::Cyclic,
            format!("Task {} loops until its condition holds", id),
        );
    }

    if state.tasks_by_id.len() == 1 {
        return StrategyDecision::new(ExecutionStrategy::Single, "Plan has a single task");
    }

    if ready.len() > 1 {
        return StrategyDecision::new(
            ExecutionStrategy::Parallel,
            format!("{} independent tasks are ready", ready.len()),
        );
    }

    StrategyDecision::new(
        ExecutionStrategy::Sequential,
        "At most one task is ready along a dependency chain",
    )
}

/// What the engine should do after evaluating a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerOutcome {
    /// Dispatch these tasks now.
    Dispatch {
        batch: Vec<TaskId>,
        strategy: ExecutionStrategy,
    },
    /// Nothing to dispatch; executors or humans still owe a response.
    Waiting,
    /// Every task reached a terminal status.
    AllDone,
    /// Nothing is ready, in flight or awaiting a human, yet tasks remain.
    Stalled { blocked: Vec<TaskId> },
}

/// Chooses dispatch batches under an optional concurrency cap.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler {
    max_parallel: Option<usize>,
}

impl Scheduler {
    /// Create a scheduler; `None` means no cap.
    pub fn new(max_parallel: Option<usize>) -> Self {
        Self { max_parallel }
    }

    /// Ready tasks that fit into the free slots, highest priority first.
    pub fn next_batch(&self, state: &ExecutionState) -> Vec<TaskId> {
        self.next_batch_where(state, |_| true)
    }

    /// Like [`next_batch`](Self::next_batch), but only ready tasks accepted
    /// by `eligible` compete for the free slots.
    pub fn next_batch_where<F>(&self, state: &ExecutionState, eligible: F) -> Vec<TaskId>
    where
        F: Fn(&Task) -> bool,
    {
        let ready = ready_set(state)
            .into_iter()
            .filter(|id| state.task(id).is_some_and(&eligible));
        match self.max_parallel {
            Some(cap) => {
                let in_flight = state.count(TaskStatus::InProgress);
                let free = cap.saturating_sub(in_flight);
                ready.take(free).collect()
            }
            None => ready.collect(),
        }
    }

    /// Decide the next step for a snapshot.
    pub fn evaluate(&self, state: &ExecutionState) -> SchedulerOutcome {
        self.evaluate_where(state, |_| true)
    }

    /// Decide the next step, dispatching only tasks accepted by `eligible`.
    ///
    /// Ready tasks that are held back count as waiting, never as stalled.
    pub fn evaluate_where<F>(&self, state: &ExecutionState, eligible: F) -> SchedulerOutcome
    where
        F: Fn(&Task) -> bool,
    {
        if state.is_complete() {
            return SchedulerOutcome::AllDone;
        }

        let batch = self.next_batch_where(state, eligible);
        if !batch.is_empty() {
            let strategy = decide_strategy(state).strategy;
            return SchedulerOutcome::Dispatch { batch, strategy };
        }

        let waiting_on_others = state.count(TaskStatus::InProgress) > 0
            || state.count(TaskStatus::NeedsApproval) > 0
            || !ready_set(state).is_empty();
        if waiting_on_others {
            return SchedulerOutcome::Waiting;
        }

        let blocked = state
            .tasks_by_id
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        SchedulerOutcome::Stalled { blocked }
    }
}
