//! Versioned plans, structural edits and the change log.
//!
//! Every accepted edit produces a new plan version. Edits are all-or-nothing:
//! they are applied to a copy which is validated before it replaces anything,
//! so a rejected batch leaves the original plan untouched.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GraphError;
use crate::graph::{GraphResult, TaskGraph};
use crate::hitl::{HitlRequestType, TimeoutAction};
use crate::task::{Parameters, Task, TaskId};

/// Adjacency map: task id to its prerequisite ids.
pub type DependencyGraph = BTreeMap<TaskId, Vec<TaskId>>;

/// Plan lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Created, not yet submitted.
    #[default]
    Draft,
    /// Waiting for a plan review.
    PendingApproval,
    /// Approved, not yet running.
    Approved,
    /// Tasks are being dispatched.
    Executing,
    /// Paused by an operator.
    Paused,
    /// Every task ended and none failed.
    Completed,
    /// Execution ended with failures or stalled.
    Failed,
    /// Rejected or cancelled.
    Cancelled,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlanStatus::Draft => "draft",
            PlanStatus::PendingApproval => "pending_approval",
            PlanStatus::Approved => "approved",
            PlanStatus::Executing => "executing",
            PlanStatus::Paused => "paused",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A structural edit to a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanEdit {
    /// Append a new task.
    AddTask { task: Task },
    /// Remove a task. Without `cascade`, a task with dependents is rejected.
    RemoveTask {
        id: TaskId,
        #[serde(default)]
        cascade: bool,
    },
    /// Change definitional fields of a task.
    UpdateTask {
        id: TaskId,
        #[serde(default)]
        tool: Option<String>,
        #[serde(default)]
        parameters: Option<Parameters>,
        #[serde(default)]
        priority: Option<i32>,
        #[serde(default)]
        max_retries: Option<u32>,
    },
    /// Replace a task's prerequisites.
    SetDependencies {
        id: TaskId,
        depends_on: BTreeSet<TaskId>,
    },
    /// Move the listed tasks to the front of the insertion order.
    Reorder { order: Vec<TaskId> },
}

impl PlanEdit {
    /// Short label used in logs.
    pub fn label(&self) -> String {
        match self {
            PlanEdit::AddTask { task } => format!("add {}", task.id),
            PlanEdit::RemoveTask { id, cascade: true } => format!("remove {} (cascade)", id),
            PlanEdit::RemoveTask { id, .. } => format!("remove {}", id),
            PlanEdit::UpdateTask { id, .. } => format!("update {}", id),
            PlanEdit::SetDependencies { id, .. } => format!("set dependencies of {}", id),
            PlanEdit::Reorder { .. } => "reorder".to_string(),
        }
    }
}

/// What a change-log entry records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    PlanCreated {
        task_count: usize,
    },
    EditApplied {
        edits: Vec<PlanEdit>,
    },
    EditRejected {
        reason: String,
    },
    StatusChanged {
        from: PlanStatus,
        to: PlanStatus,
    },
    RetryScheduled {
        task_id: TaskId,
        attempt: u32,
        error: String,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskBlocked {
        task_id: TaskId,
    },
    TaskSkipped {
        task_id: TaskId,
        reason: String,
    },
    LoopIteration {
        task_id: TaskId,
        iteration: u32,
    },
    ResultDiscarded {
        task_id: TaskId,
        reason: String,
    },
    TaskRequeued {
        task_id: TaskId,
        reason: String,
    },
    HitlRaised {
        request_id: String,
        request_type: HitlRequestType,
        task_id: Option<TaskId>,
    },
    HitlResolved {
        request_id: String,
        action: String,
    },
    HitlTimedOut {
        request_id: String,
        default_action: TimeoutAction,
    },
    HitlResponseRejected {
        request_id: String,
        reason: String,
    },
    SessionPaused,
    SessionResumed,
    SessionCancelled {
        reason: String,
    },
    SessionStalled {
        blocked: Vec<TaskId>,
    },
}

/// One append-only change-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Plan version this entry produced or refers to.
    pub version: u64,
    /// When it happened.
    pub at: DateTime<Utc>,
    /// What happened.
    pub kind: ChangeKind,
}

/// The versioned collection of tasks for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier.
    pub id: String,
    /// Tasks in insertion order.
    pub tasks: Vec<Task>,
    /// Derived from the tasks' `depends_on`.
    pub dependency_graph: DependencyGraph,
    /// Lifecycle status.
    pub status: PlanStatus,
    /// Bumped on every accepted edit.
    pub version: u64,
    /// Decision history.
    pub change_log: Vec<ChangeLogEntry>,
}

impl Plan {
    /// Build and validate a draft plan.
    pub fn new(tasks: Vec<Task>) -> GraphResult<Self> {
        Self::new_at(tasks, Utc::now())
    }

    /// Same as [`Plan::new`] with an explicit timestamp.
    pub fn new_at(tasks: Vec<Task>, at: DateTime<Utc>) -> GraphResult<Self> {
        TaskGraph::new(&tasks).validate()?;
        let task_count = tasks.len();
        let mut plan = Self {
            id: uuid::Uuid::new_v4().to_string(),
            dependency_graph: build_dependency_graph(&tasks),
            tasks,
            status: PlanStatus::Draft,
            version: 1,
            change_log: Vec::new(),
        };
        plan.record(at, ChangeKind::PlanCreated { task_count });
        Ok(plan)
    }

    /// Get a task definition by id.
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    /// Check if the plan contains a task.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.task(id).is_some()
    }

    /// Graph view over the tasks.
    pub fn graph(&self) -> TaskGraph<'_> {
        TaskGraph::new(&self.tasks)
    }

    /// Validate the dependency graph.
    pub fn validate(&self) -> GraphResult<()> {
        self.graph().validate()
    }

    /// Deterministic topological order.
    pub fn topological_order(&self) -> GraphResult<Vec<TaskId>> {
        self.graph().topological_order()
    }

    /// Append an audit entry referencing the current version.
    pub fn record(&mut self, at: DateTime<Utc>, kind: ChangeKind) {
        self.change_log.push(ChangeLogEntry {
            version: self.version,
            at,
            kind,
        });
    }

    /// Change status, logging the transition.
    pub fn set_status(&mut self, to: PlanStatus, at: DateTime<Utc>) {
        if self.status != to {
            let from = self.status;
            self.status = to;
            self.record(at, ChangeKind::StatusChanged { from, to });
        }
    }

    /// Apply a batch of edits atomically.
    pub fn apply_edits(&self, edits: &[PlanEdit]) -> GraphResult<Plan> {
        self.apply_edits_at(edits, Utc::now())
    }

    /// Same as [`Plan::apply_edits`] with an explicit timestamp.
    ///
    /// On error `self` is untouched; recording the rejection is up to the
    /// caller.
    pub fn apply_edits_at(&self, edits: &[PlanEdit], at: DateTime<Utc>) -> GraphResult<Plan> {
        let mut next = self.clone();
        for edit in edits {
            next.apply_one(edit)?;
        }
        next.validate()?;
        next.dependency_graph = build_dependency_graph(&next.tasks);
        next.version += 1;
        next.record(
            at,
            ChangeKind::EditApplied {
                edits: edits.to_vec(),
            },
        );
        Ok(next)
    }

    fn position(&self, id: &TaskId) -> GraphResult<usize> {
        self.tasks
            .iter()
            .position(|t| &t.id == id)
            .ok_or_else(|| GraphError::TaskNotFound(id.clone()))
    }

    fn apply_one(&mut self, edit: &PlanEdit) -> GraphResult<()> {
        match edit {
            PlanEdit::AddTask { task } => {
                if self.contains(&task.id) {
                    return Err(GraphError::DuplicateTask(task.id.clone()));
                }
                self.tasks.push(task.clone());
            }
            PlanEdit::RemoveTask { id, cascade } => {
                self.position(id)?;
                let graph = self.graph();
                let doomed: HashSet<TaskId> = if *cascade {
                    let mut set: HashSet<TaskId> = graph.dependents_of(id).into_iter().collect();
                    set.insert(id.clone());
                    set
                } else {
                    if let Some(dependent) = graph.direct_dependents(id).into_iter().next() {
                        return Err(GraphError::DanglingDependency {
                            task: dependent,
                            dependency: id.clone(),
                        });
                    }
                    HashSet::from([id.clone()])
                };
                self.tasks.retain(|t| !doomed.contains(&t.id));
            }
            PlanEdit::UpdateTask {
                id,
                tool,
                parameters,
                priority,
                max_retries,
            } => {
                let position = self.position(id)?;
                let task = &mut self.tasks[position];
                if let Some(tool) = tool {
                    task.tool = tool.clone();
                }
                if let Some(parameters) = parameters {
                    task.parameters = parameters.clone();
                }
                if let Some(priority) = priority {
                    task.priority = *priority;
                }
                if let Some(max_retries) = max_retries {
                    task.max_retries = *max_retries;
                }
                task.version += 1;
            }
            PlanEdit::SetDependencies { id, depends_on } => {
                let position = self.position(id)?;
                let task = &mut self.tasks[position];
                task.depends_on = depends_on.clone();
                task.version += 1;
            }
            PlanEdit::Reorder { order } => {
                for id in order {
                    self.position(id)?;
                }
                let mut reordered = Vec::with_capacity(self.tasks.len());
                for id in order {
                    if let Some(i) = self.tasks.iter().position(|t| &t.id == id) {
                        reordered.push(self.tasks.remove(i));
                    }
                }
                reordered.append(&mut self.tasks);
                self.tasks = reordered;
            }
        }
        Ok(())
    }
}

/// Derive the adjacency map from tasks.
pub fn build_dependency_graph(tasks: &[Task]) -> DependencyGraph {
    tasks
        .iter()
        .map(|t| (t.id.clone(), t.depends_on.iter().cloned().collect()))
        .collect()
}

/// Build a draft plan from tasks plus an explicit edge map.
///
/// `edges` maps a task id to extra prerequisites, merged into that task's
/// `depends_on`. Keys naming unknown tasks are rejected.
pub fn create_plan(tasks: Vec<Task>, edges: &DependencyGraph) -> GraphResult<Plan> {
    let mut tasks = tasks;
    for (id, prerequisites) in edges {
        let task = tasks
            .iter_mut()
            .find(|t| &t.id == id)
            .ok_or_else(|| GraphError::TaskNotFound(id.clone()))?;
        task.depends_on.extend(prerequisites.iter().cloned());
    }
    Plan::new(tasks)
}

/// Parse a plan description: `{"tasks": [...], "edges": {...}}`.
pub fn plan_from_json(value: Value) -> Result<(Vec<Task>, DependencyGraph), serde_json::Error> {
    #[derive(Deserialize)]
    struct PlanFile {
        tasks: Vec<Task>,
        #[serde(default)]
        edges: DependencyGraph,
    }
    let file: PlanFile = serde_json::from_value(value)?;
    Ok((file.tasks, file.edges))
}
