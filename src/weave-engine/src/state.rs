//! Execution state and the reducers that are its only write path.
//!
//! Both reducers are pure `(current, incoming) -> merged` functions. They are
//! idempotent under replay, so a completion delivered twice (for example after
//! a reconnect) leaves the state unchanged the second time.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::task::{ExecutionResult, Task, TaskId, TaskStatus};

/// Mutable aggregate the scheduler reads and the reducers write.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Runtime copy of every task, in insertion order.
    pub tasks_by_id: IndexMap<TaskId, Task>,
    /// Latest result per task.
    pub results_by_task_id: IndexMap<TaskId, ExecutionResult>,
}

impl ExecutionState {
    /// Build the initial state from planned tasks.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        Self {
            tasks_by_id: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
            results_by_task_id: IndexMap::new(),
        }
    }

    /// Get a task by id.
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks_by_id.get(id)
    }

    /// Count tasks with a given status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks_by_id
            .values()
            .filter(|t| t.status == status)
            .count()
    }

    /// Ids of tasks currently handed to executors.
    pub fn in_flight(&self) -> Vec<TaskId> {
        self.with_status(TaskStatus::InProgress)
    }

    /// Ids of tasks with a given status, in insertion order.
    pub fn with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks_by_id
            .values()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Check if every task reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.tasks_by_id.values().all(|t| t.status.is_terminal())
    }
}

/// Merge task updates by id.
///
/// An update replaces the existing entry if it carries a higher version or if
/// the existing entry is not terminal. Terminal entries are never overwritten
/// by a lower or equal version. Unknown ids are appended.
pub fn reduce_tasks(
    existing: &IndexMap<TaskId, Task>,
    updates: &[Task],
) -> IndexMap<TaskId, Task> {
    let mut merged = existing.clone();
    for update in updates {
        match merged.get_mut(&update.id) {
            Some(current) => {
                if update.version > current.version || !current.status.is_terminal() {
                    *current = update.clone();
                }
            }
            None => {
                merged.insert(update.id.clone(), update.clone());
            }
        }
    }
    merged
}

/// Shallow merge of results; on collision the incoming value wins only if it
/// completed strictly later.
pub fn reduce_results(
    existing: &IndexMap<TaskId, ExecutionResult>,
    incoming: &IndexMap<TaskId, ExecutionResult>,
) -> IndexMap<TaskId, ExecutionResult> {
    let mut merged = existing.clone();
    for (id, result) in incoming {
        match merged.get(id) {
            Some(current) if current.completed_at >= result.completed_at => {}
            _ => {
                merged.insert(id.clone(), result.clone());
            }
        }
    }
    merged
}

/// Move the listed ids to the front, in the given order. Unlisted entries
/// keep their relative order; unknown ids are ignored.
pub fn reduce_order(existing: &IndexMap<TaskId, Task>, order: &[TaskId]) -> IndexMap<TaskId, Task> {
    let mut merged = IndexMap::with_capacity(existing.len());
    for id in order {
        if let Some(task) = existing.get(id) {
            merged.insert(id.clone(), task.clone());
        }
    }
    for (id, task) in existing {
        if !merged.contains_key(id) {
            merged.insert(id.clone(), task.clone());
        }
    }
    merged
}

/// A batch of partial updates applied atomically by [`StateStore::apply`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    /// Task values to fold in via [`reduce_tasks`].
    pub tasks: Vec<Task>,
    /// Results to fold in via [`reduce_results`].
    pub results: IndexMap<TaskId, ExecutionResult>,
    /// Optional new insertion order.
    pub order: Option<Vec<TaskId>>,
}

impl StateUpdate {
    /// Create an empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Update a single task.
    pub fn task(task: Task) -> Self {
        Self::new().with_task(task)
    }

    /// Add a task value.
    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Add several task values.
    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    /// Add a result.
    pub fn with_result(mut self, id: TaskId, result: ExecutionResult) -> Self {
        self.results.insert(id, result);
        self
    }

    /// Replace the insertion order.
    pub fn with_order(mut self, order: Vec<TaskId>) -> Self {
        self.order = Some(order);
        self
    }

    /// Check if the update carries anything.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.results.is_empty() && self.order.is_none()
    }
}

/// Owner of an [`ExecutionState`].
///
/// `apply` is the only way to change the state; readers work on a
/// [`snapshot`](StateStore::snapshot).
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    state: ExecutionState,
}

impl StateStore {
    /// Create a store from planned tasks.
    pub fn new(tasks: impl IntoIterator<Item = Task>) -> Self {
        Self {
            state: ExecutionState::from_tasks(tasks),
        }
    }

    /// Wrap an existing state (e.g. restored from a checkpoint).
    pub fn from_state(state: ExecutionState) -> Self {
        Self { state }
    }

    /// Fold an update into the state.
    pub fn apply(&mut self, update: StateUpdate) {
        if update.is_empty() {
            return;
        }
        let mut tasks = reduce_tasks(&self.state.tasks_by_id, &update.tasks);
        if let Some(order) = &update.order {
            tasks = reduce_order(&tasks, order);
        }
        let results = reduce_results(&self.state.results_by_task_id, &update.results);
        self.state = ExecutionState {
            tasks_by_id: tasks,
            results_by_task_id: results,
        };
    }

    /// Fold task values only.
    pub fn apply_tasks(&mut self, tasks: Vec<Task>) {
        self.apply(StateUpdate::new().with_tasks(tasks));
    }

    /// Immutable copy for readers.
    pub fn snapshot(&self) -> ExecutionState {
        self.state.clone()
    }

    /// Borrow the current state.
    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    /// Get a task by id.
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.state.task(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Parameters;
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;

    fn map(tasks: Vec<Task>) -> IndexMap<TaskId, Task> {
        tasks.into_iter().map(|t| (t.id.clone(), t)).collect()
    }

    #[test]
    fn test_newer_version_replaces() {
        let a = Task::new("a", "echo");
        let existing = map(vec![a.clone()]);
        let merged = reduce_tasks(&existing, &[a.started()]);
        assert_eq!(merged[&TaskId::from("a")].status, TaskStatus::InProgress);
    }

    #[test]
    fn test_terminal_entry_survives_stale_update() {
        let a = Task::new("a", "echo");
        let running = a.started();
        let done = running.completed(Parameters::new());
        let existing = map(vec![done.clone()]);

        let merged = reduce_tasks(&existing, &[running.clone(), done.clone()]);
        assert_eq!(merged[&TaskId::from("a")], done);
    }

    #[test]
    fn test_conflicting_terminal_update_same_version_loses() {
        let running = Task::new("a", "echo").started();
        let completed = running.completed(Parameters::new());
        let cancelled = running.cancelled();
        assert_eq!(completed.version, cancelled.version);

        let first = reduce_tasks(&map(vec![running]), &[completed.clone()]);
        let second = reduce_tasks(&first, &[cancelled]);
        assert_eq!(second[&TaskId::from("a")], completed);
    }

    #[test]
    fn test_new_ids_appended() {
        let existing = map(vec![Task::new("a", "echo")]);
        let merged = reduce_tasks(&existing, &[Task::new("b", "echo")]);
        let keys: Vec<_> = merged.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_reducer_idempotent() {
        let a = Task::new("a", "echo");
        let b = Task::new("b", "echo");
        let existing = map(vec![a.clone(), b.clone()]);
        let updates = vec![a.started(), b.started().completed(Parameters::new())];

        let once = reduce_tasks(&existing, &updates);
        let twice = reduce_tasks(&once, &updates);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_result_reducer_prefers_newer() {
        let now = Utc::now();
        let older = ExecutionResult::failure("first").completed_at(now);
        let newer = ExecutionResult::success(Parameters::new()).completed_at(now + Duration::seconds(1));

        let existing: IndexMap<TaskId, ExecutionResult> = [("a".into(), newer.clone())].into_iter().collect();
        let incoming: IndexMap<TaskId, ExecutionResult> = [("a".into(), older.clone())].into_iter().collect();
        let merged = reduce_results(&existing, &incoming);
        assert_eq!(merged[&TaskId::from("a")], newer);

        let flipped = reduce_results(&incoming, &existing);
        assert_eq!(flipped[&TaskId::from("a")], newer);
    }

    #[test]
    fn test_result_reducer_equal_timestamp_keeps_existing() {
        let now = Utc::now();
        let first = ExecutionResult::failure("first").completed_at(now);
        let second = ExecutionResult::failure("second").completed_at(now);

        let existing: IndexMap<TaskId, ExecutionResult> = [("a".into(), first.clone())].into_iter().collect();
        let incoming: IndexMap<TaskId, ExecutionResult> = [("a".into(), second)].into_iter().collect();
        assert_eq!(reduce_results(&existing, &incoming)[&TaskId::from("a")], first);
    }

    #[test]
    fn test_reduce_order_moves_listed_first() {
        let existing = map(vec![
            Task::new("a", "echo"),
            Task::new("b", "echo"),
            Task::new("c", "echo"),
        ]);
        let merged = reduce_order(&existing, &["c".into(), "ghost".into()]);
        let keys: Vec<_> = merged.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_store_apply_and_snapshot() {
        let mut store = StateStore::new(vec![Task::new("a", "echo")]);
        let before = store.snapshot();

        let a = store.task(&"a".into()).cloned().unwrap();
        let done = a.started().completed(Parameters::new());
        store.apply(
            StateUpdate::task(done.clone())
                .with_result("a".into(), ExecutionResult::success(Parameters::new())),
        );

        assert_eq!(before.count(TaskStatus::Pending), 1);
        assert_eq!(store.state().count(TaskStatus::Completed), 1);
        assert!(store.state().results_by_task_id.contains_key(&TaskId::from("a")));
        assert!(store.state().is_complete());
    }
}
