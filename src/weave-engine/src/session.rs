//! Session: the top-level container persisted by checkpoint gateways.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hitl::HitlRequest;
use crate::plan::Plan;
use crate::state::ExecutionState;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Dispatching or waiting on executors.
    #[default]
    Running,
    /// Suspended on a HITL request.
    AwaitingHuman,
    /// Paused by an operator.
    Paused,
    /// Every task ended and none failed.
    Completed,
    /// Every task ended and at least one failed.
    Failed,
    /// No further progress is possible.
    Stalled,
    /// Cancelled by an operator or a rejected plan review.
    Cancelled,
    /// A HITL request timed out with the `expire` policy.
    Expired,
}

impl SessionStatus {
    /// Check if the session is finished.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Stalled
                | SessionStatus::Cancelled
                | SessionStatus::Expired
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Running => "running",
            SessionStatus::AwaitingHuman => "awaiting_human",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Stalled => "stalled",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Everything needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub plan: Plan,
    pub execution_state: ExecutionState,
    #[serde(default)]
    pub pending_hitl: Option<HitlRequest>,
    /// Requests that already reached a terminal status, oldest first.
    #[serde(default)]
    pub hitl_history: Vec<HitlRequest>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Start a session for a plan.
    pub fn new(session_id: impl Into<String>, plan: Plan, now: DateTime<Utc>) -> Self {
        let execution_state = ExecutionState::from_tasks(plan.tasks.iter().cloned());
        Self {
            session_id: session_id.into(),
            plan,
            execution_state,
            pending_hitl: None,
            hitl_history: Vec::new(),
            status: SessionStatus::Running,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the session is finished.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskStatus};

    #[test]
    fn test_session_round_trip() {
        let plan = Plan::new(vec![
            Task::new("a", "echo"),
            Task::new("b", "echo").depends_on("a").with_priority(2),
        ])
        .unwrap();
        let mut session = Session::new("s-1", plan, Utc::now());
        let a = session.execution_state.tasks_by_id[0].started();
        session.execution_state.tasks_by_id.insert(a.id.clone(), a);

        let json = serde_json::to_string(&session).unwrap();
        let restored: Session = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, session);
        let a = &restored.execution_state.tasks_by_id[0];
        assert_eq!(a.status, TaskStatus::InProgress);
        assert_eq!(a.version, 2);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::AwaitingHuman.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
        assert!(SessionStatus::Stalled.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
    }
}
