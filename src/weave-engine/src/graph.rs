//! Dependency graph validation, ordering and readiness.
//!
//! [`TaskGraph`] borrows a plan's tasks and answers structural questions
//! (validation, topological order, transitive dependents). Readiness is
//! computed from an [`ExecutionState`] snapshot by [`ready_set`] and
//! [`blocked_candidates`].
//!
//! # Example
//!
//! ```rust
//! use weave_engine::graph::TaskGraph;
//! use weave_engine::task::Task;
//!
//! let tasks = vec![
//!     Task::new("a", "echo"),
//!     Task::new("b", "echo").depends_on("a"),
//!     Task::new("c", "echo").depends_on("a").with_priority(10),
//!     Task::new("d", "echo").depends_on("b").depends_on("c"),
//! ];
//!
//! let graph = TaskGraph::new(&tasks);
//! graph.validate().unwrap();
//!
//! let order: Vec<String> = graph
//!     .topological_order()
//!     .unwrap()
//!     .into_iter()
//!     .map(|id| id.to_string())
//!     .collect();
//! assert_eq!(order, vec!["a", "c", "b", "d"]);
//! ```

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque, btree_set};

use crate::error::GraphError;
use crate::state::ExecutionState;
use crate::task::{Task, TaskId, TaskStatus};

/// Result type for graph operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// Read-only view over a set of tasks and their `depends_on` edges.
pub struct TaskGraph<'a> {
    tasks: &'a [Task],
    index: HashMap<&'a TaskId, usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl<'a> TaskGraph<'a> {
    /// Build a graph view; insertion order is the slice order.
    pub fn new(tasks: &'a [Task]) -> Self {
        let mut index = HashMap::with_capacity(tasks.len());
        for (position, task) in tasks.iter().enumerate() {
            index.entry(&task.id).or_insert(position);
        }
        Self { tasks, index }
    }

    /// Number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Get a task by id.
    pub fn get(&self, id: &TaskId) -> Option<&'a Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Validate the graph.
    ///
    /// Checks, in order: duplicate ids, self dependencies, references to
    /// unknown tasks, then cycles. A cycle is reported as the node sequence
    /// that closes it, e.g. `[A, B, A]`.
    pub fn validate(&self) -> GraphResult<()> {
        let mut seen = HashSet::with_capacity(self.tasks.len());
        for task in self.tasks {
            if !seen.insert(&task.id) {
                return Err(GraphError::DuplicateTask(task.id.clone()));
            }
        }

        for task in self.tasks {
            if task.depends_on.contains(&task.id) {
                return Err(GraphError::SelfDependency(task.id.clone()));
            }
            if let Some(missing) = task.depends_on.iter().find(|d| !self.index.contains_key(d)) {
                return Err(GraphError::DanglingDependency {
                    task: task.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let mut marks = vec![Mark::Unvisited; self.tasks.len()];
        for start in 0..self.tasks.len() {
            if marks[start] == Mark::Unvisited {
                self.visit(start, &mut marks)?;
            }
        }

        Ok(())
    }

    /// Depth-first walk from `start` over `depends_on` edges.
    ///
    /// The frame stack doubles as the current path, so a back edge yields the
    /// cycle in visiting order.
    fn visit(&self, start: usize, marks: &mut [Mark]) -> GraphResult<()> {
        let mut frames: Vec<(usize, btree_set::Iter<'a, TaskId>)> =
            vec![(start, self.tasks[start].depends_on.iter())];
        marks[start] = Mark::OnStack;

        while let Some((node, deps)) = frames.last_mut() {
            let node = *node;
            let Some(dep) = deps.next() else {
                marks[node] = Mark::Done;
                frames.pop();
                continue;
            };
            let Some(&next) = self.index.get(dep) else {
                continue;
            };
            match marks[next] {
                Mark::OnStack => {
                    let from = frames.iter().position(|(n, _)| *n == next).unwrap_or(0);
                    let mut cycle: Vec<TaskId> = frames[from..]
                        .iter()
                        .map(|(n, _)| self.tasks[*n].id.clone())
                        .collect();
                    cycle.push(self.tasks[next].id.clone());
                    return Err(GraphError::Cycle { path: cycle });
                }
                Mark::Unvisited => {
                    marks[next] = Mark::OnStack;
                    frames.push((next, self.tasks[next].depends_on.iter()));
                }
                Mark::Done => {}
            }
        }

        Ok(())
    }

    /// Kahn's algorithm; ties go to higher priority, then earlier insertion.
    pub fn topological_order(&self) -> GraphResult<Vec<TaskId>> {
        let mut in_degree: Vec<usize> = self
            .tasks
            .iter()
            .map(|t| t.depends_on.iter().filter(|d| self.index.contains_key(d)).count())
            .collect();
        let dependents = self.dependents_index();

        let mut heap = BinaryHeap::new();
        for (position, &degree) in in_degree.iter().enumerate() {
            if degree == 0 {
                heap.push((self.tasks[position].priority, Reverse(position)));
            }
        }

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some((_, Reverse(position))) = heap.pop() {
            order.push(self.tasks[position].id.clone());
            for &dependent in &dependents[position] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    heap.push((self.tasks[dependent].priority, Reverse(dependent)));
                }
            }
        }

        if order.len() != self.tasks.len() {
            self.validate()?;
        }

        Ok(order)
    }

    /// All tasks that depend on `id`, directly or transitively, in insertion order.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&root) = self.index.get(id) else {
            return Vec::new();
        };
        let dependents = self.dependents_index();

        let mut reached = vec![false; self.tasks.len()];
        let mut queue = VecDeque::from([root]);
        while let Some(node) = queue.pop_front() {
            for &dependent in &dependents[node] {
                if !reached[dependent] {
                    reached[dependent] = true;
                    queue.push_back(dependent);
                }
            }
        }

        reached[root] = false;
        self.tasks
            .iter()
            .zip(reached)
            .filter(|(_, hit)| *hit)
            .map(|(t, _)| t.id.clone())
            .collect()
    }

    /// Direct dependents of `id`.
    pub fn direct_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.depends_on.contains(id))
            .map(|t| t.id.clone())
            .collect()
    }

    fn dependents_index(&self) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); self.tasks.len()];
        for (position, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                if let Some(&d) = self.index.get(dep) {
                    dependents[d].push(position);
                }
            }
        }
        dependents
    }
}

/// Tasks eligible for dispatch, in scheduling order.
///
/// A task is ready iff it is `Pending` and every dependency is `Completed`.
/// Ordering is priority descending, then insertion order ascending.
pub fn ready_set(state: &ExecutionState) -> Vec<TaskId> {
    let mut ready: Vec<&Task> = state
        .tasks_by_id
        .values()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            t.depends_on.iter().all(|d| {
                state
                    .tasks_by_id
                    .get(d)
                    .is_some_and(|dep| dep.status == TaskStatus::Completed)
            })
        })
        .collect();

    // Stable sort keeps insertion order among equal priorities.
    ready.sort_by_key(|t| Reverse(t.priority));
    ready.into_iter().map(|t| t.id.clone()).collect()
}

/// `Pending` tasks that can never become ready because a dependency ended
/// without success or is itself blocked.
pub fn blocked_candidates(state: &ExecutionState) -> Vec<TaskId> {
    state
        .tasks_by_id
        .values()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            t.depends_on.iter().any(|d| {
                state.tasks_by_id.get(d).is_some_and(|dep| {
                    dep.status.is_terminal_failure() || dep.status == TaskStatus::Blocked
                })
            })
        })
        .map(|t| t.id.clone())
        .collect()
}
