//! Human-in-the-loop interrupt/resume protocol.
//!
//! [`HitlController`] is a pure state machine over [`HitlRequest`] values: it
//! opens requests, validates responses, resolves them and applies the
//! configured [`TimeoutPolicy`] once a request is overdue. Waiting happens
//! outside the controller; the orchestrator persists the session while a
//! request is pending and calls [`HitlController::expire_if_due`] on each tick.
//!
//! # Example
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use serde_json::json;
//! use weave_engine::hitl::{HitlController, HitlRequestType, HitlStatus, TimeoutAction};
//!
//! let controller = HitlController::default();
//! let now = Utc::now();
//! let request = controller.open("session-1", None, HitlRequestType::PlanReview, json!({}), now);
//!
//! assert!(controller.expire_if_due(&request, now).is_none());
//!
//! let later = request.timeout_at + Duration::seconds(1);
//! let (expired, action) = controller.expire_if_due(&request, later).unwrap();
//! assert_eq!(expired.status, HitlStatus::TimedOut);
//! assert_eq!(action, TimeoutAction::Approve);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::defaults;
use crate::error::HitlError;
use crate::plan::{Plan, PlanEdit};
use crate::task::{InterruptKind, TaskId};

/// Kind of human interaction requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlRequestType {
    /// Review of the whole plan before any task starts.
    PlanReview,
    /// Approval of a single task.
    Approval,
    /// A clarifying answer for a task.
    Clarification,
    /// A value supplied for a task.
    Input,
}

impl std::fmt::Display for HitlRequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HitlRequestType::PlanReview => "plan_review",
            HitlRequestType::Approval => "approval",
            HitlRequestType::Clarification => "clarification",
            HitlRequestType::Input => "input",
        };
        f.write_str(s)
    }
}

impl From<InterruptKind> for HitlRequestType {
    fn from(kind: InterruptKind) -> Self {
        match kind {
            InterruptKind::Approval => HitlRequestType::Approval,
            InterruptKind::Clarification => HitlRequestType::Clarification,
            InterruptKind::Input => HitlRequestType::Input,
        }
    }
}

/// Lifecycle of a request. Everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HitlStatus {
    #[default]
    Pending,
    Resolved,
    TimedOut,
    Cancelled,
}

impl HitlStatus {
    /// Check if the request can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HitlStatus::Pending)
    }
}

/// A human response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HitlAction {
    /// Proceed unchanged.
    Approve,
    /// Skip the task, or cancel the plan for a plan review.
    Reject {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Structured edits, applied through the validated edit path.
    Modify { edits: Vec<PlanEdit> },
    /// Natural-language instruction turned into edits by an interpreter.
    Instruct { instruction: String },
    /// Answer for a clarification or input request.
    Provide { value: Value },
}

impl HitlAction {
    /// Short label for logs and the change log.
    pub fn label(&self) -> String {
        match self {
            HitlAction::Approve => "approve".to_string(),
            HitlAction::Reject { reason: Some(r) } => format!("reject: {}", r),
            HitlAction::Reject { reason: None } => "reject".to_string(),
            HitlAction::Modify { edits } => format!("modify ({} edits)", edits.len()),
            HitlAction::Instruct { .. } => "instruct".to_string(),
            HitlAction::Provide { .. } => "provide".to_string(),
        }
    }
}

/// Default action applied when a request times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Proceed as if approved.
    Approve,
    /// Treat as rejected.
    Reject,
    /// Skip the task; for a plan review, skip the review and proceed.
    Skip,
    /// End the session as `Expired`.
    Expire,
}

impl std::fmt::Display for TimeoutAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TimeoutAction::Approve => "approve",
            TimeoutAction::Reject => "reject",
            TimeoutAction::Skip => "skip",
            TimeoutAction::Expire => "expire",
        };
        f.write_str(s)
    }
}

/// Default action per request type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    #[serde(default = "default_plan_review_action")]
    pub plan_review: TimeoutAction,
    #[serde(default = "default_task_action")]
    pub approval: TimeoutAction,
    #[serde(default = "default_task_action")]
    pub clarification: TimeoutAction,
    #[serde(default = "default_task_action")]
    pub input: TimeoutAction,
}

fn default_plan_review_action() -> TimeoutAction {
    TimeoutAction::Approve
}

fn default_task_action() -> TimeoutAction {
    TimeoutAction::Skip
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            plan_review: default_plan_review_action(),
            approval: default_task_action(),
            clarification: default_task_action(),
            input: default_task_action(),
        }
    }
}

impl TimeoutPolicy {
    /// Action for a request type.
    pub fn action_for(&self, request_type: HitlRequestType) -> TimeoutAction {
        match request_type {
            HitlRequestType::PlanReview => self.plan_review,
            HitlRequestType::Approval => self.approval,
            HitlRequestType::Clarification => self.clarification,
            HitlRequestType::Input => self.input,
        }
    }

    /// Override the action for one request type.
    pub fn with(mut self, request_type: HitlRequestType, action: TimeoutAction) -> Self {
        match request_type {
            HitlRequestType::PlanReview => self.plan_review = action,
            HitlRequestType::Approval => self.approval = action,
            HitlRequestType::Clarification => self.clarification = action,
            HitlRequestType::Input => self.input = action,
        }
        self
    }
}

/// Response window per request type, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitlTimeouts {
    #[serde(default = "default_plan_review_secs")]
    pub plan_review_secs: u64,
    #[serde(default = "default_approval_secs")]
    pub approval_secs: u64,
    #[serde(default = "default_clarification_secs")]
    pub clarification_secs: u64,
    #[serde(default = "default_input_secs")]
    pub input_secs: u64,
}

fn default_plan_review_secs() -> u64 {
    defaults::PLAN_REVIEW_TIMEOUT_SECS
}

fn default_approval_secs() -> u64 {
    defaults::APPROVAL_TIMEOUT_SECS
}

fn default_clarification_secs() -> u64 {
    defaults::CLARIFICATION_TIMEOUT_SECS
}

fn default_input_secs() -> u64 {
    defaults::INPUT_TIMEOUT_SECS
}

impl Default for HitlTimeouts {
    fn default() -> Self {
        Self {
            plan_review_secs: default_plan_review_secs(),
            approval_secs: default_approval_secs(),
            clarification_secs: default_clarification_secs(),
            input_secs: default_input_secs(),
        }
    }
}

impl HitlTimeouts {
    /// Same window for every request type.
    pub fn uniform(secs: u64) -> Self {
        Self {
            plan_review_secs: secs,
            approval_secs: secs,
            clarification_secs: secs,
            input_secs: secs,
        }
    }

    /// Window for a request type.
    pub fn secs_for(&self, request_type: HitlRequestType) -> u64 {
        match request_type {
            HitlRequestType::PlanReview => self.plan_review_secs,
            HitlRequestType::Approval => self.approval_secs,
            HitlRequestType::Clarification => self.clarification_secs,
            HitlRequestType::Input => self.input_secs,
        }
    }
}

/// How a request reached its terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum HitlResolution {
    /// A human answered.
    Human {
        action: HitlAction,
        at: DateTime<Utc>,
    },
    /// The timeout default fired.
    Timeout {
        action: TimeoutAction,
        at: DateTime<Utc>,
    },
    /// The session was cancelled while waiting.
    Cancelled { reason: String, at: DateTime<Utc> },
}

/// A pending or finished request for human interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlRequest {
    pub request_id: String,
    pub session_id: String,
    /// Task the request holds back; `None` for a plan review.
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub request_type: HitlRequestType,
    /// Context shown to the human.
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    #[serde(default)]
    pub status: HitlStatus,
    #[serde(default)]
    pub resolution: Option<HitlResolution>,
}

impl HitlRequest {
    /// Check if the request is still waiting.
    pub fn is_pending(&self) -> bool {
        self.status == HitlStatus::Pending
    }

    /// Check if the deadline has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && now >= self.timeout_at
    }
}

/// Turns a natural-language instruction into structured plan edits.
#[async_trait]
pub trait InstructionInterpreter: Send + Sync {
    /// Interpret `instruction` against `plan`.
    async fn interpret(&self, plan: &Plan, instruction: &str) -> Result<Vec<PlanEdit>, String>;
}

/// State machine for HITL requests.
#[derive(Debug, Clone, Default)]
pub struct HitlController {
    timeouts: HitlTimeouts,
    policy: TimeoutPolicy,
}

impl HitlController {
    /// Create a controller.
    pub fn new(timeouts: HitlTimeouts, policy: TimeoutPolicy) -> Self {
        Self { timeouts, policy }
    }

    /// The configured timeout policy.
    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    /// Open a new pending request.
    pub fn open(
        &self,
        session_id: &str,
        task_id: Option<TaskId>,
        request_type: HitlRequestType,
        payload: Value,
        now: DateTime<Utc>,
    ) -> HitlRequest {
        let window = self.timeouts.secs_for(request_type);
        HitlRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            task_id,
            request_type,
            payload,
            created_at: now,
            timeout_at: now + Duration::seconds(window as i64),
            status: HitlStatus::Pending,
            resolution: None,
        }
    }

    /// Check a response against the pending request.
    ///
    /// A rejected response leaves the request (and its deadline) untouched.
    pub fn validate_response(
        &self,
        request: &HitlRequest,
        request_id: &str,
        action: &HitlAction,
    ) -> Result<(), HitlError> {
        if request.request_id != request_id {
            return Err(HitlError::RequestMismatch {
                given: request_id.to_string(),
                pending: request.request_id.clone(),
            });
        }
        if request.status.is_terminal() {
            return Err(HitlError::AlreadyTerminal(request.request_id.clone()));
        }

        let invalid = |reason: &str| HitlError::InvalidResponse {
            request_type: request.request_type.to_string(),
            reason: reason.to_string(),
        };

        match (request.request_type, action) {
            (_, HitlAction::Modify { edits }) if edits.is_empty() => {
                Err(invalid("modify requires at least one edit"))
            }
            (_, HitlAction::Instruct { instruction }) if instruction.trim().is_empty() => {
                Err(invalid("instruction is empty"))
            }
            (HitlRequestType::PlanReview | HitlRequestType::Approval, HitlAction::Provide { .. }) => {
                Err(invalid("a value can only answer clarification or input requests"))
            }
            (HitlRequestType::Clarification | HitlRequestType::Input, HitlAction::Approve) => {
                Err(invalid("a value is required"))
            }
            (_, HitlAction::Provide { value }) if value.is_null() => {
                Err(invalid("provided value is null"))
            }
            _ => Ok(()),
        }
    }

    /// Mark a request resolved by a human.
    pub fn resolve(&self, request: &HitlRequest, action: HitlAction, now: DateTime<Utc>) -> HitlRequest {
        let mut resolved = request.clone();
        resolved.status = HitlStatus::Resolved;
        resolved.resolution = Some(HitlResolution::Human { action, at: now });
        resolved
    }

    /// Apply the timeout default if the request is overdue.
    pub fn expire_if_due(
        &self,
        request: &HitlRequest,
        now: DateTime<Utc>,
    ) -> Option<(HitlRequest, TimeoutAction)> {
        if !request.is_due(now) {
            return None;
        }
        let action = self.policy.action_for(request.request_type);
        let mut expired = request.clone();
        expired.status = HitlStatus::TimedOut;
        expired.resolution = Some(HitlResolution::Timeout { action, at: now });
        Some((expired, action))
    }

    /// Cancel a pending request. Terminal requests are returned unchanged.
    pub fn cancel(&self, request: &HitlRequest, reason: &str, now: DateTime<Utc>) -> HitlRequest {
        if request.status.is_terminal() {
            return request.clone();
        }
        let mut cancelled = request.clone();
        cancelled.status = HitlStatus::Cancelled;
        cancelled.resolution = Some(HitlResolution::Cancelled {
            reason: reason.to_string(),
            at: now,
        });
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn controller() -> HitlController {
        HitlController::new(HitlTimeouts::uniform(5), TimeoutPolicy::default())
    }

    #[test]
    fn test_open_sets_deadline() {
        let now = Utc::now();
        let request = controller().open("s", None, HitlRequestType::PlanReview, json!({}), now);
        assert_eq!(request.timeout_at, now + Duration::seconds(5));
        assert!(request.is_pending());
        assert!(request.resolution.is_none());
    }

    #[test]
    fn test_timeout_fires_exactly_at_deadline() {
        let c = controller();
        let now = Utc::now();
        let request = c.open("s", Some("t".into()), HitlRequestType::Approval, json!({}), now);

        assert!(c.expire_if_due(&request, now + Duration::seconds(4)).is_none());
        let (expired, action) = c.expire_if_due(&request, now + Duration::seconds(5)).unwrap();
        assert_eq!(expired.status, HitlStatus::TimedOut);
        assert_eq!(action, TimeoutAction::Skip);
        assert!(c.expire_if_due(&expired, now + Duration::seconds(60)).is_none());
    }

    #[test]
    fn test_policy_override() {
        let policy = TimeoutPolicy::default().with(HitlRequestType::Input, TimeoutAction::Expire);
        assert_eq!(policy.action_for(HitlRequestType::Input), TimeoutAction::Expire);
        assert_eq!(policy.action_for(HitlRequestType::PlanReview), TimeoutAction::Approve);
    }

    #[test]
    fn test_invalid_responses_rejected() {
        let c = controller();
        let now = Utc::now();
        let review = c.open("s", None, HitlRequestType::PlanReview, json!({}), now);
        let id = review.request_id.clone();

        assert!(matches!(
            c.validate_response(&review, &id, &HitlAction::Provide { value: json!(1) }),
            Err(HitlError::InvalidResponse { .. })
        ));
        assert!(matches!(
            c.validate_response(&review, &id, &HitlAction::Modify { edits: vec![] }),
            Err(HitlError::InvalidResponse { .. })
        ));
        assert!(matches!(
            c.validate_response(&review, "other", &HitlAction::Approve),
            Err(HitlError::RequestMismatch { .. })
        ));
        assert!(c.validate_response(&review, &id, &HitlAction::Approve).is_ok());

        let input = c.open("s", Some("t".into()), HitlRequestType::Input, json!({}), now);
        let input_id = input.request_id.clone();
        assert!(c.validate_response(&input, &input_id, &HitlAction::Approve).is_err());
        assert!(c
            .validate_response(&input, &input_id, &HitlAction::Provide { value: json!("eu") })
            .is_ok());
    }

    #[test]
    fn test_terminal_request_rejects_response() {
        let c = controller();
        let now = Utc::now();
        let request = c.open("s", None, HitlRequestType::PlanReview, json!({}), now);
        let resolved = c.resolve(&request, HitlAction::Approve, now);

        assert_eq!(resolved.status, HitlStatus::Resolved);
        assert_eq!(
            c.validate_response(&resolved, &request.request_id, &HitlAction::Approve),
            Err(HitlError::AlreadyTerminal(request.request_id.clone()))
        );
    }

    #[test]
    fn test_cancel_keeps_terminal_requests() {
        let c = controller();
        let now = Utc::now();
        let request = c.open("s", None, HitlRequestType::PlanReview, json!({}), now);
        let cancelled = c.cancel(&request, "operator", now);
        assert_eq!(cancelled.status, HitlStatus::Cancelled);

        let (timed_out, _) = c.expire_if_due(&request, request.timeout_at).unwrap();
        assert_eq!(c.cancel(&timed_out, "operator", now), timed_out);
    }

    #[test]
    fn test_action_serialization() {
        let action: HitlAction =
            serde_json::from_value(json!({"action": "reject", "reason": "too risky"})).unwrap();
        assert_eq!(
            action,
            HitlAction::Reject {
                reason: Some("too risky".to_string())
            }
        );
        assert_eq!(action.label(), "reject: too risky");
    }
}
