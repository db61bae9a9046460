//! Error types for weave-engine.
//!
//! Each component owns a narrow error enum; [`EngineError`] wraps them all for
//! the inbound control surface.

use std::path::PathBuf;

use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Structural errors raised by graph validation and plan edits.
///
/// These are always reported before any mutation takes place.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Following `depends_on` edges leads back to a task on the current path.
    #[error("Dependency cycle detected: {}", format_path(.path))]
    Cycle { path: Vec<TaskId> },

    /// A task references a prerequisite that does not exist, or removing a
    /// task would leave a dependent pointing at nothing.
    #[error("Task {task} has a dangling dependency on {dependency}")]
    DanglingDependency { task: TaskId, dependency: TaskId },

    /// A task lists itself as a prerequisite.
    #[error("Task {0} depends on itself")]
    SelfDependency(TaskId),

    /// Two tasks share the same id.
    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),
}

fn format_path(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Errors from checkpoint gateways.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Checkpoint not found.
    #[error("Checkpoint not found: {0}")]
    NotFound(String),
}

/// Result type for checkpoint operations.
pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

/// Errors for human-in-the-loop responses.
///
/// A rejected response leaves the original request pending.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HitlError {
    /// No request is waiting for a response.
    #[error("No pending HITL request for session {0}")]
    NoPendingRequest(String),

    /// The response names a different request than the pending one.
    #[error("Request {given} does not match pending request {pending}")]
    RequestMismatch { given: String, pending: String },

    /// The response does not fit the request type.
    #[error("Invalid response for {request_type} request: {reason}")]
    InvalidResponse {
        request_type: String,
        reason: String,
    },

    /// The request was already resolved, timed out or cancelled.
    #[error("HITL request {0} is already terminal")]
    AlreadyTerminal(String),
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML content.
    #[error("Failed to parse TOML in '{path}': {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Invalid configuration value.
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

/// Top-level error for the orchestration engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Graph validation or plan edit failure.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Checkpoint gateway failure.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// HITL response failure.
    #[error("HITL error: {0}")]
    Hitl(#[from] HitlError),

    /// Configuration failure.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Session not found.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session already reached a terminal status.
    #[error("Session {0} is already finished")]
    SessionTerminal(String),

    /// Operation not valid in the current session status.
    #[error("Invalid transition for session {session}: {message}")]
    InvalidTransition { session: String, message: String },

    /// Task result submitted for a task that is not in flight.
    #[error("Task {task} is not in progress (status {status:?})")]
    TaskNotInFlight { task: TaskId, status: TaskStatus },

    /// Task not found in the session.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_path() {
        let err = GraphError::Cycle {
            path: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: A -> B -> A");
    }

    #[test]
    fn test_dangling_dependency_display() {
        let err = GraphError::DanglingDependency {
            task: "build".into(),
            dependency: "fetch".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("build"));
        assert!(msg.contains("fetch"));
    }

    #[test]
    fn test_engine_error_from_variants() {
        let graph = EngineError::from(GraphError::SelfDependency("a".into()));
        assert!(matches!(graph, EngineError::Graph(_)));

        let hitl = EngineError::from(HitlError::NoPendingRequest("s1".to_string()));
        assert!(matches!(hitl, EngineError::Hitl(_)));

        let checkpoint = EngineError::from(CheckpointError::NotFound("s1".to_string()));
        assert!(matches!(checkpoint, EngineError::Checkpoint(_)));
    }
}
