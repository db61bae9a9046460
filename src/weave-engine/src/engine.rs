//! The orchestrator and its inbound control surface.
//!
//! [`Orchestrator`] owns every live session. It is driven from outside:
//! callers invoke [`advance`](Orchestrator::advance) after completions and
//! [`tick`](Orchestrator::tick) on a timer, or use
//! [`run_until_settled`](Orchestrator::run_until_settled) which does both.
//!
//! Each `advance` works on a single snapshot:
//!
//! 1. Fold queued executor completions through the reducers (retry, loop and
//!    failure handling happens here).
//! 2. Apply the timeout default of an overdue HITL request.
//! 3. Mark tasks whose dependencies can no longer succeed as `Blocked`.
//! 4. Raise a request for the first ready task with an unanswered interrupt
//!    (it moves to `NeedsApproval`), then ask the scheduler for a batch among
//!    the tasks that need no human.
//! 5. Finish the session when everything is terminal or nothing can progress.
//!
//! Completions that arrive while a step runs wait in the session queue until
//! the next `advance`, so a task is never dispatched twice.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::checkpoint::CheckpointGateway;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::dispatcher::{CompletionSender, Dispatcher, ExecutorRegistry, TaskCompletion};
use crate::error::{EngineError, HitlError, Result};
use crate::graph::{blocked_candidates, ready_set};
use crate::hitl::{
    HitlAction, HitlController, HitlRequest, HitlRequestType, InstructionInterpreter,
    TimeoutAction,
};
use crate::plan::{ChangeKind, DependencyGraph, Plan, PlanEdit, PlanStatus};
use crate::scheduler::{ExecutionStrategy, Scheduler, SchedulerOutcome};
use crate::session::{Session, SessionStatus};
use crate::state::{StateStore, StateUpdate};
use crate::task::{ExecutionResult, Task, TaskId, TaskStatus};

/// What a call to [`Orchestrator::advance`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvanceOutcome {
    /// Tasks handed to executors in this step.
    pub dispatched: Vec<TaskId>,
    /// Strategy chosen for the dispatched batch.
    pub strategy: Option<ExecutionStrategy>,
    /// The request the session is waiting on, if any.
    pub hitl_request: Option<HitlRequest>,
    /// The session reached a terminal status.
    pub done: bool,
    /// Session status after the step.
    pub status: SessionStatus,
    /// Tasks still running after the step.
    pub in_flight: usize,
}

struct SessionRuntime {
    session_id: String,
    plan: Plan,
    store: StateStore,
    pending_hitl: Option<HitlRequest>,
    hitl_history: Vec<HitlRequest>,
    status: SessionStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completions_tx: CompletionSender,
    completions_rx: mpsc::UnboundedReceiver<TaskCompletion>,
    cancel: CancellationToken,
    last_checkpoint: DateTime<Utc>,
}

impl SessionRuntime {
    fn from_session(session: Session, now: DateTime<Utc>) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            session_id: session.session_id,
            plan: session.plan,
            store: StateStore::from_state(session.execution_state),
            pending_hitl: session.pending_hitl,
            hitl_history: session.hitl_history,
            status: session.status,
            created_at: session.created_at,
            updated_at: session.updated_at,
            completions_tx,
            completions_rx,
            cancel: CancellationToken::new(),
            last_checkpoint: now,
        }
    }

    fn to_session(&self) -> Session {
        Session {
            session_id: self.session_id.clone(),
            plan: self.plan.clone(),
            execution_state: self.store.snapshot(),
            pending_hitl: self.pending_hitl.clone(),
            hitl_history: self.hitl_history.clone(),
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn task(&self, id: &TaskId) -> Option<Task> {
        self.store.task(id).cloned()
    }

    fn blocks_dispatch(&self) -> bool {
        match self.status {
            SessionStatus::Running => false,
            SessionStatus::AwaitingHuman => self
                .pending_hitl
                .as_ref()
                .is_some_and(|r| r.request_type == HitlRequestType::PlanReview),
            _ => true,
        }
    }

    /// Running or AwaitingHuman depending on the pending request; terminal
    /// and paused sessions keep their status.
    fn refresh_status(&mut self) {
        if self.status.is_terminal() || self.status == SessionStatus::Paused {
            return;
        }
        self.status = if self.pending_hitl.is_some() {
            SessionStatus::AwaitingHuman
        } else {
            SessionStatus::Running
        };
    }

    fn archive_pending(&mut self, finished: HitlRequest) {
        self.pending_hitl = None;
        self.hitl_history.push(finished);
    }

    fn plan_status_when_running(&self) -> PlanStatus {
        let review_pending = self
            .pending_hitl
            .as_ref()
            .is_some_and(|r| r.request_type == HitlRequestType::PlanReview);
        if review_pending {
            PlanStatus::PendingApproval
        } else if self
            .store
            .state()
            .tasks_by_id
            .values()
            .any(|t| t.status != TaskStatus::Pending || t.retry_count > 0)
        {
            PlanStatus::Executing
        } else {
            PlanStatus::Approved
        }
    }
}

/// Task-graph orchestration engine.
pub struct Orchestrator {
    config: EngineConfig,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    hitl: HitlController,
    checkpoint: Arc<dyn CheckpointGateway>,
    clock: Arc<dyn Clock>,
    interpreter: Option<Arc<dyn InstructionInterpreter>>,
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionRuntime>>>>,
}

impl Orchestrator {
    /// Create an orchestrator with injected executors and checkpoint store.
    pub fn new(
        config: EngineConfig,
        executors: ExecutorRegistry,
        checkpoint: Arc<dyn CheckpointGateway>,
    ) -> Self {
        let dispatcher = Dispatcher::new(executors, config.task_timeout());
        let scheduler = Scheduler::new(config.max_parallel_limit());
        let hitl = HitlController::new(config.hitl_timeouts, config.timeout_policy);
        Self {
            config,
            dispatcher,
            scheduler,
            hitl,
            checkpoint,
            clock: Arc::new(SystemClock),
            interpreter: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enable natural-language instructions in HITL responses.
    pub fn with_interpreter(mut self, interpreter: Arc<dyn InstructionInterpreter>) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Build and validate a draft plan.
    ///
    /// Tasks that declare no retry budget get the configured default.
    pub fn create_plan(&self, tasks: Vec<Task>, edges: &DependencyGraph) -> Result<Plan> {
        let tasks = tasks
            .into_iter()
            .map(|t| {
                if t.max_retries == 0 {
                    t.with_max_retries(self.config.default_max_retries)
                } else {
                    t
                }
            })
            .collect();
        let plan = crate::plan::create_plan(tasks, edges)?;
        debug!(plan_id = %plan.id, tasks = plan.tasks.len(), "Created plan");
        Ok(plan)
    }

    /// Register a new session for a plan and return its id.
    ///
    /// With plan review enabled the session starts suspended on a
    /// `PlanReview` request.
    pub async fn start_session(&self, plan: Plan) -> Result<String> {
        plan.validate()?;
        let now = self.clock.now();
        let session_id = uuid::Uuid::new_v4().to_string();

        let mut rt = SessionRuntime::from_session(Session::new(&session_id, plan, now), now);
        if self.config.require_plan_review {
            rt.plan.set_status(PlanStatus::PendingApproval, now);
            self.raise_plan_review(&mut rt, now);
        } else {
            rt.plan.set_status(PlanStatus::Approved, now);
        }
        self.save(&mut rt, now).await?;

        info!(
            session_id = %session_id,
            tasks = rt.plan.tasks.len(),
            status = %rt.status,
            "Session started"
        );
        self.sessions
            .lock()
            .await
            .insert(session_id.clone(), Arc::new(Mutex::new(rt)));
        Ok(session_id)
    }

    /// Load a session from the checkpoint store after a restart.
    ///
    /// Tasks that were in flight are re-queued; their executors are gone.
    pub async fn restore_session(&self, session_id: &str) -> Result<()> {
        if self.sessions.lock().await.contains_key(session_id) {
            return Err(EngineError::InvalidTransition {
                session: session_id.to_string(),
                message: "session is already active".to_string(),
            });
        }

        let session = self
            .checkpoint
            .load(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        let now = self.clock.now();
        let mut rt = SessionRuntime::from_session(session, now);
        let lost: Vec<Task> = rt
            .store
            .state()
            .tasks_by_id
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.with_status(TaskStatus::Pending))
            .collect();
        for task in &lost {
            rt.plan.record(
                now,
                ChangeKind::TaskRequeued {
                    task_id: task.id.clone(),
                    reason: "invocation lost on restart".to_string(),
                },
            );
        }
        if !lost.is_empty() {
            rt.store.apply_tasks(lost);
        }

        info!(session_id = %session_id, status = %rt.status, "Session restored");
        self.sessions
            .lock()
            .await
            .insert(session_id.to_string(), Arc::new(Mutex::new(rt)));
        Ok(())
    }

    /// Snapshot of a session.
    pub async fn session(&self, session_id: &str) -> Result<Session> {
        let runtime = self.runtime(session_id).await?;
        let rt = runtime.lock().await;
        Ok(rt.to_session())
    }

    /// Ids of sessions held in memory.
    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run one scheduling step.
    #[instrument(skip(self))]
    pub async fn advance(&self, session_id: &str) -> Result<AdvanceOutcome> {
        let runtime = self.runtime(session_id).await?;
        let mut rt = runtime.lock().await;
        let now = self.clock.now();

        if rt.status.is_terminal() {
            return Ok(outcome(&rt, Vec::new(), None));
        }

        self.drain_completions(&mut rt, now);
        self.apply_hitl_timeout(&mut rt, now).await?;

        let mut dispatched = Vec::new();
        let mut strategy = None;

        if !rt.status.is_terminal() && !rt.blocks_dispatch() {
            self.settle_blocked(&mut rt, now);

            let ready = ready_set(rt.store.state());
            if self.gate_interrupts(&mut rt, &ready, now) {
                self.save(&mut rt, now).await?;
            }

            // Tasks still holding an interrupt wait for their own request.
            match self
                .scheduler
                .evaluate_where(rt.store.state(), |t| !t.needs_human())
            {
                SchedulerOutcome::Dispatch {
                    batch,
                    strategy: chosen,
                } => {
                    self.dispatch_batch(&mut rt, &batch, now);
                    strategy = Some(chosen);
                    debug!(
                        session_id = %rt.session_id,
                        strategy = %chosen,
                        tasks = batch.len(),
                        "Dispatched batch"
                    );
                    dispatched = batch;
                }
                SchedulerOutcome::Waiting => {}
                SchedulerOutcome::AllDone => {
                    let failed = rt.store.state().count(TaskStatus::Failed) > 0;
                    let (status, plan_status) = if failed {
                        (SessionStatus::Failed, PlanStatus::Failed)
                    } else {
                        (SessionStatus::Completed, PlanStatus::Completed)
                    };
                    self.finish(&mut rt, status, plan_status, now).await?;
                }
                SchedulerOutcome::Stalled { blocked } => {
                    warn!(
                        session_id = %rt.session_id,
                        blocked = blocked.len(),
                        "Session stalled"
                    );
                    rt.plan.record(now, ChangeKind::SessionStalled { blocked });
                    self.finish(&mut rt, SessionStatus::Stalled, PlanStatus::Failed, now)
                        .await?;
                }
            }
        }

        rt.updated_at = now;
        self.maybe_checkpoint(&mut rt, now).await?;
        Ok(outcome(&rt, dispatched, strategy))
    }

    /// Queue an externally produced result for an in-flight task.
    ///
    /// The result is folded in by the next [`advance`](Self::advance).
    pub async fn submit_task_result(
        &self,
        session_id: &str,
        task_id: &TaskId,
        result: ExecutionResult,
    ) -> Result<()> {
        let runtime = self.runtime(session_id).await?;
        let rt = runtime.lock().await;
        if rt.status.is_terminal() {
            return Err(EngineError::SessionTerminal(session_id.to_string()));
        }

        let task = rt
            .task(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.clone()))?;
        if task.status != TaskStatus::InProgress {
            return Err(EngineError::TaskNotInFlight {
                task: task_id.clone(),
                status: task.status,
            });
        }

        let completion = TaskCompletion {
            task_id: task_id.clone(),
            dispatched_version: task.version,
            result,
            cancelled: false,
        };
        if rt.completions_tx.send(completion).is_err() {
            warn!(session_id = %session_id, task_id = %task_id, "Completion queue closed");
        }
        Ok(())
    }

    /// Answer the pending HITL request.
    ///
    /// An invalid response is rejected and the request stays pending with its
    /// original deadline.
    #[instrument(skip(self, action), fields(action = %action.label()))]
    pub async fn respond_to_hitl(
        &self,
        session_id: &str,
        request_id: &str,
        action: HitlAction,
    ) -> Result<Plan> {
        let runtime = self.runtime(session_id).await?;
        let mut rt = runtime.lock().await;
        let now = self.clock.now();

        if rt.status.is_terminal() {
            return Err(EngineError::SessionTerminal(session_id.to_string()));
        }

        // An overdue request has already been decided by its timeout.
        self.apply_hitl_timeout(&mut rt, now).await?;

        let request = match rt.pending_hitl.clone() {
            Some(request) => request,
            None => {
                if let Some(done) = rt.hitl_history.iter().find(|r| r.request_id == request_id) {
                    return Err(HitlError::AlreadyTerminal(done.request_id.clone()).into());
                }
                return Err(HitlError::NoPendingRequest(session_id.to_string()).into());
            }
        };

        if let Err(e) = self.hitl.validate_response(&request, request_id, &action) {
            rt.plan.record(
                now,
                ChangeKind::HitlResponseRejected {
                    request_id: request_id.to_string(),
                    reason: e.to_string(),
                },
            );
            return Err(e.into());
        }

        let edits = match &action {
            HitlAction::Modify { edits } => Some(edits.clone()),
            HitlAction::Instruct { instruction } => {
                Some(self.interpret(&mut rt, &request, instruction, now).await?)
            }
            _ => None,
        };

        if let Some(edits) = edits {
            match rt.plan.apply_edits_at(&edits, now) {
                Ok(next) => self.reconcile(&mut rt, next),
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Rejected plan edit");
                    rt.plan.record(
                        now,
                        ChangeKind::EditRejected {
                            reason: e.to_string(),
                        },
                    );
                    return Err(e.into());
                }
            }
        }

        let resolved = self.hitl.resolve(&request, action.clone(), now);
        rt.plan.record(
            now,
            ChangeKind::HitlResolved {
                request_id: request.request_id.clone(),
                action: action.label(),
            },
        );
        rt.archive_pending(resolved);

        match (&request.task_id, &action) {
            (None, HitlAction::Reject { reason }) => {
                let reason = reason.clone().unwrap_or_else(|| "plan rejected".to_string());
                self.terminate(&mut rt, &reason, now).await?;
            }
            (None, _) => self.approve_plan(&mut rt, now),
            (Some(task_id), HitlAction::Reject { reason }) => {
                let reason = reason.clone().unwrap_or_else(|| "rejected by reviewer".to_string());
                self.skip_task(&mut rt, task_id, &reason, now);
            }
            (Some(task_id), HitlAction::Provide { value }) => {
                if let Some(task) = rt.task(task_id).filter(|t| t.status == TaskStatus::NeedsApproval) {
                    rt.store.apply_tasks(vec![task.with_human_input(value.clone())]);
                }
            }
            (Some(task_id), _) => self.release_task(&mut rt, task_id),
        }

        rt.refresh_status();
        rt.updated_at = now;
        // Terminal transitions have already checkpointed.
        if !rt.status.is_terminal() {
            self.save(&mut rt, now).await?;
        }
        info!(
            session_id = %session_id,
            request_id = %request.request_id,
            status = %rt.status,
            "HITL request resolved"
        );
        Ok(rt.plan.clone())
    }

    /// Stop dispatching new work. In-flight tasks keep running.
    pub async fn pause(&self, session_id: &str) -> Result<()> {
        let runtime = self.runtime(session_id).await?;
        let mut rt = runtime.lock().await;
        let now = self.clock.now();

        if rt.status.is_terminal() {
            return Err(EngineError::SessionTerminal(session_id.to_string()));
        }
        if rt.status == SessionStatus::Paused {
            return Ok(());
        }

        rt.status = SessionStatus::Paused;
        rt.plan.set_status(PlanStatus::Paused, now);
        rt.plan.record(now, ChangeKind::SessionPaused);
        self.save(&mut rt, now).await?;
        info!(session_id = %session_id, "Session paused");
        Ok(())
    }

    /// Resume a paused session.
    pub async fn resume(&self, session_id: &str) -> Result<()> {
        let runtime = self.runtime(session_id).await?;
        let mut rt = runtime.lock().await;
        let now = self.clock.now();

        if rt.status != SessionStatus::Paused {
            return Err(EngineError::InvalidTransition {
                session: session_id.to_string(),
                message: format!("cannot resume a {} session", rt.status),
            });
        }

        rt.status = SessionStatus::Running;
        rt.refresh_status();
        let plan_status = rt.plan_status_when_running();
        rt.plan.set_status(plan_status, now);
        rt.plan.record(now, ChangeKind::SessionResumed);
        rt.updated_at = now;
        self.save(&mut rt, now).await?;
        info!(session_id = %session_id, status = %rt.status, "Session resumed");
        Ok(())
    }

    /// Cancel a session: stop executors, cancel open tasks and the pending
    /// request, then checkpoint once.
    pub async fn cancel(&self, session_id: &str, reason: &str) -> Result<()> {
        let runtime = self.runtime(session_id).await?;
        let mut rt = runtime.lock().await;
        let now = self.clock.now();

        if rt.status.is_terminal() {
            return Err(EngineError::SessionTerminal(session_id.to_string()));
        }
        self.terminate(&mut rt, reason, now).await
    }

    /// Apply overdue HITL defaults and periodic checkpoints for every session.
    ///
    /// Returns the ids of sessions whose pending request timed out.
    pub async fn tick(&self) -> Result<Vec<String>> {
        let runtimes: Vec<Arc<Mutex<SessionRuntime>>> =
            self.sessions.lock().await.values().cloned().collect();
        let now = self.clock.now();

        let checks = runtimes.into_iter().map(|runtime| async move {
            let mut rt = runtime.lock().await;
            if rt.status.is_terminal() {
                return Ok::<_, EngineError>(None);
            }
            let timed_out = self.apply_hitl_timeout(&mut rt, now).await?;
            self.maybe_checkpoint(&mut rt, now).await?;
            Ok(timed_out.then(|| rt.session_id.clone()))
        });

        let mut timed_out = Vec::new();
        for checked in futures::future::join_all(checks).await {
            if let Some(id) = checked? {
                timed_out.push(id);
            }
        }
        timed_out.sort();
        Ok(timed_out)
    }

    /// Drop finished sessions older than the retention window, from memory
    /// and from the checkpoint store.
    pub async fn purge_finished(&self) -> Result<usize> {
        let cutoff = self.clock.now() - self.config.retention();
        let mut sessions = self.sessions.lock().await;
        let mut expired = Vec::new();
        for (id, runtime) in sessions.iter() {
            let rt = runtime.lock().await;
            if rt.status.is_terminal() && rt.updated_at < cutoff {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            sessions.remove(id);
        }
        drop(sessions);

        let removed = self.checkpoint.purge_older_than(cutoff).await?;
        debug!(in_memory = expired.len(), stored = removed, "Purged finished sessions");
        Ok(removed)
    }

    /// Drive a session until it finishes or needs a human or operator.
    pub async fn run_until_settled(&self, session_id: &str) -> Result<Session> {
        loop {
            let step = self.advance(session_id).await?;
            if step.done {
                break;
            }
            if step.in_flight == 0 && step.dispatched.is_empty() {
                break;
            }
            tokio::time::sleep(self.config.tick_interval()).await;
            self.tick().await?;
        }
        self.session(session_id).await
    }

    async fn runtime(&self, session_id: &str) -> Result<Arc<Mutex<SessionRuntime>>> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    fn drain_completions(&self, rt: &mut SessionRuntime, now: DateTime<Utc>) {
        while let Ok(completion) = rt.completions_rx.try_recv() {
            self.fold_completion(rt, completion, now);
        }
    }

    fn fold_completion(&self, rt: &mut SessionRuntime, completion: TaskCompletion, now: DateTime<Utc>) {
        let TaskCompletion {
            task_id,
            dispatched_version,
            result,
            cancelled,
        } = completion;

        let current = match rt.task(&task_id) {
            Some(task) if !cancelled
                && task.status == TaskStatus::InProgress
                && task.version == dispatched_version =>
            {
                task
            }
            _ => {
                let reason = if cancelled {
                    "invocation cancelled"
                } else {
                    "task is no longer in flight for this dispatch"
                };
                debug!(session_id = %rt.session_id, task_id = %task_id, reason, "Discarded result");
                rt.plan.record(
                    now,
                    ChangeKind::ResultDiscarded {
                        task_id,
                        reason: reason.to_string(),
                    },
                );
                return;
            }
        };
        // Result timestamps follow the engine clock.
        let result = result.completed_at(now);

        let next = if result.success {
            match &current.loop_spec {
                Some(spec) if !spec.is_satisfied(&result.data) => {
                    if current.iteration + 1 < spec.max_iterations {
                        let next = current.next_iteration();
                        rt.plan.record(
                            now,
                            ChangeKind::LoopIteration {
                                task_id: task_id.clone(),
                                iteration: next.iteration,
                            },
                        );
                        next
                    } else {
                        let error = format!(
                            "Loop condition on '{}' not met after {} iterations",
                            spec.field, spec.max_iterations
                        );
                        warn!(session_id = %rt.session_id, task_id = %task_id, "{}", error);
                        rt.plan.record(
                            now,
                            ChangeKind::TaskFailed {
                                task_id: task_id.clone(),
                                error: error.clone(),
                            },
                        );
                        current.failed(error)
                    }
                }
                Some(_) => current.completed_iteration(result.data.clone()),
                None => current.completed(result.data.clone()),
            }
        } else {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());
            if current.retry_count < current.max_retries {
                let next = current.requeued_for_retry();
                warn!(
                    session_id = %rt.session_id,
                    task_id = %task_id,
                    attempt = next.retry_count,
                    error = %error,
                    "Task failed, retrying"
                );
                rt.plan.record(
                    now,
                    ChangeKind::RetryScheduled {
                        task_id: task_id.clone(),
                        attempt: next.retry_count,
                        error,
                    },
                );
                next
            } else {
                warn!(session_id = %rt.session_id, task_id = %task_id, error = %error, "Task failed");
                rt.plan.record(
                    now,
                    ChangeKind::TaskFailed {
                        task_id: task_id.clone(),
                        error: error.clone(),
                    },
                );
                current.failed(error)
            }
        };

        rt.store
            .apply(StateUpdate::task(next).with_result(task_id, result));
    }

    fn settle_blocked(&self, rt: &mut SessionRuntime, now: DateTime<Utc>) {
        loop {
            let candidates = blocked_candidates(rt.store.state());
            if candidates.is_empty() {
                break;
            }
            let mut updates = Vec::with_capacity(candidates.len());
            for id in candidates {
                if let Some(task) = rt.task(&id) {
                    debug!(session_id = %rt.session_id, task_id = %id, "Task blocked");
                    rt.plan.record(now, ChangeKind::TaskBlocked { task_id: id });
                    updates.push(task.blocked());
                }
            }
            rt.store.apply_tasks(updates);
        }
    }

    /// Move the first ready task with an unanswered interrupt to `NeedsApproval`.
    /// Only one request is pending at a time; others wait their turn.
    fn gate_interrupts(&self, rt: &mut SessionRuntime, ready: &[TaskId], now: DateTime<Utc>) -> bool {
        let mut raised = false;
        for id in ready {
            if rt.pending_hitl.is_some() {
                break;
            }
            let Some(task) = rt.task(id).filter(|t| t.needs_human()) else {
                continue;
            };
            let Some(interrupt) = task.interrupt.clone() else {
                continue;
            };

            let payload = json!({
                "task_id": task.id,
                "tool": task.tool,
                "prompt": interrupt.prompt,
                "parameters": task.parameters,
            });
            let request = self.hitl.open(
                &rt.session_id,
                Some(task.id.clone()),
                interrupt.kind.into(),
                payload,
                now,
            );
            rt.store.apply_tasks(vec![task.awaiting_approval()]);
            self.register_request(rt, request, now);
            raised = true;
        }
        raised
    }

    fn raise_plan_review(&self, rt: &mut SessionRuntime, now: DateTime<Utc>) {
        let order = rt.plan.topological_order().unwrap_or_default();
        let payload = json!({
            "plan_id": rt.plan.id,
            "plan_version": rt.plan.version,
            "order": order,
            "tasks": rt.plan.tasks,
        });
        let request = self
            .hitl
            .open(&rt.session_id, None, HitlRequestType::PlanReview, payload, now);
        self.register_request(rt, request, now);
    }

    fn register_request(&self, rt: &mut SessionRuntime, request: HitlRequest, now: DateTime<Utc>) {
        info!(
            session_id = %rt.session_id,
            request_id = %request.request_id,
            request_type = %request.request_type,
            "HITL request raised"
        );
        rt.plan.record(
            now,
            ChangeKind::HitlRaised {
                request_id: request.request_id.clone(),
                request_type: request.request_type,
                task_id: request.task_id.clone(),
            },
        );
        rt.pending_hitl = Some(request);
        rt.refresh_status();
    }

    fn dispatch_batch(&self, rt: &mut SessionRuntime, batch: &[TaskId], now: DateTime<Utc>) {
        let started: Vec<Task> = batch
            .iter()
            .filter_map(|id| rt.task(id))
            .map(|t| t.started())
            .collect();
        rt.store.apply_tasks(started.clone());
        rt.plan.set_status(PlanStatus::Executing, now);

        for task in started {
            let upstream: IndexMap<TaskId, ExecutionResult> = task
                .depends_on
                .iter()
                .filter_map(|d| {
                    rt.store
                        .state()
                        .results_by_task_id
                        .get(d)
                        .map(|r| (d.clone(), r.clone()))
                })
                .collect();
            self.dispatcher.dispatch(
                &rt.session_id,
                task,
                upstream,
                rt.cancel.child_token(),
                rt.completions_tx.clone(),
            );
        }
    }

    /// Returns true if the pending request timed out.
    async fn apply_hitl_timeout(&self, rt: &mut SessionRuntime, now: DateTime<Utc>) -> Result<bool> {
        let Some(request) = rt.pending_hitl.clone() else {
            return Ok(false);
        };
        let Some((expired, action)) = self.hitl.expire_if_due(&request, now) else {
            return Ok(false);
        };

        warn!(
            session_id = %rt.session_id,
            request_id = %request.request_id,
            default_action = %action,
            "HITL request timed out"
        );
        rt.plan.record(
            now,
            ChangeKind::HitlTimedOut {
                request_id: request.request_id.clone(),
                default_action: action,
            },
        );
        rt.archive_pending(expired);

        match (&request.task_id, action) {
            (_, TimeoutAction::Expire) => {
                self.cancel_open_tasks(rt);
                self.finish(rt, SessionStatus::Expired, PlanStatus::Cancelled, now)
                    .await?;
                return Ok(true);
            }
            (None, TimeoutAction::Approve | TimeoutAction::Skip) => self.approve_plan(rt, now),
            (None, TimeoutAction::Reject) => {
                self.terminate(rt, "plan review timed out", now).await?;
                return Ok(true);
            }
            (Some(task_id), TimeoutAction::Approve) => self.release_task(rt, task_id),
            (Some(task_id), TimeoutAction::Reject | TimeoutAction::Skip) => {
                self.skip_task(rt, task_id, "HITL request timed out", now)
            }
        }

        rt.refresh_status();
        rt.updated_at = now;
        self.save(rt, now).await?;
        Ok(true)
    }

    async fn interpret(
        &self,
        rt: &mut SessionRuntime,
        request: &HitlRequest,
        instruction: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<PlanEdit>> {
        let rejection = |reason: String| HitlError::InvalidResponse {
            request_type: request.request_type.to_string(),
            reason,
        };

        let Some(interpreter) = &self.interpreter else {
            let err = rejection("no instruction interpreter is configured".to_string());
            rt.plan.record(
                now,
                ChangeKind::HitlResponseRejected {
                    request_id: request.request_id.clone(),
                    reason: err.to_string(),
                },
            );
            return Err(err.into());
        };

        match interpreter.interpret(&rt.plan, instruction).await {
            Ok(edits) if !edits.is_empty() => Ok(edits),
            Ok(_) => Err(rejection("instruction produced no edits".to_string()).into()),
            Err(reason) => {
                let err = rejection(reason);
                rt.plan.record(
                    now,
                    ChangeKind::HitlResponseRejected {
                        request_id: request.request_id.clone(),
                        reason: err.to_string(),
                    },
                );
                Err(err.into())
            }
        }
    }

    /// Fold a new plan version into the execution state.
    ///
    /// New tasks are appended, changed definitions replace open tasks (in
    /// flight ones keep running as dispatched), removed open tasks are
    /// cancelled and the insertion order follows the plan.
    fn reconcile(&self, rt: &mut SessionRuntime, next: Plan) {
        let mut updates = Vec::new();
        for def in &next.tasks {
            match rt.task(&def.id) {
                None => updates.push(def.clone()),
                Some(current) => {
                    let open = !current.status.is_terminal() && current.status != TaskStatus::InProgress;
                    if open && !current.same_definition(def) {
                        updates.push(current.redefined_from(def));
                    }
                }
            }
        }

        for current in rt.store.state().tasks_by_id.values() {
            if !next.contains(&current.id) && !current.status.is_terminal() {
                updates.push(current.cancelled());
            }
        }

        let order = next.tasks.iter().map(|t| t.id.clone()).collect();
        rt.store
            .apply(StateUpdate::new().with_tasks(updates).with_order(order));
        debug!(
            session_id = %rt.session_id,
            plan_version = next.version,
            "Reconciled plan edit"
        );
        rt.plan = next;
    }

    fn approve_plan(&self, rt: &mut SessionRuntime, now: DateTime<Utc>) {
        if rt.plan.status == PlanStatus::PendingApproval {
            rt.plan.set_status(PlanStatus::Approved, now);
        }
    }

    fn release_task(&self, rt: &mut SessionRuntime, task_id: &TaskId) {
        if let Some(task) = rt.task(task_id).filter(|t| t.status == TaskStatus::NeedsApproval) {
            rt.store.apply_tasks(vec![task.cleared_interrupt()]);
        }
    }

    fn skip_task(&self, rt: &mut SessionRuntime, task_id: &TaskId, reason: &str, now: DateTime<Utc>) {
        if let Some(task) = rt.task(task_id).filter(|t| !t.status.is_terminal()) {
            rt.plan.record(
                now,
                ChangeKind::TaskSkipped {
                    task_id: task_id.clone(),
                    reason: reason.to_string(),
                },
            );
            rt.store.apply_tasks(vec![task.skipped()]);
        }
    }

    fn cancel_open_tasks(&self, rt: &mut SessionRuntime) {
        let open: Vec<Task> = rt
            .store
            .state()
            .tasks_by_id
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.cancelled())
            .collect();
        if !open.is_empty() {
            rt.store.apply_tasks(open);
        }
    }

    async fn terminate(&self, rt: &mut SessionRuntime, reason: &str, now: DateTime<Utc>) -> Result<()> {
        rt.cancel.cancel();
        self.cancel_open_tasks(rt);
        if let Some(request) = rt.pending_hitl.clone() {
            let cancelled = self.hitl.cancel(&request, reason, now);
            rt.archive_pending(cancelled);
        }
        rt.plan.record(
            now,
            ChangeKind::SessionCancelled {
                reason: reason.to_string(),
            },
        );
        info!(session_id = %rt.session_id, reason, "Session cancelled");
        self.finish(rt, SessionStatus::Cancelled, PlanStatus::Cancelled, now)
            .await
    }

    async fn finish(
        &self,
        rt: &mut SessionRuntime,
        status: SessionStatus,
        plan_status: PlanStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        rt.cancel.cancel();
        rt.status = status;
        rt.plan.set_status(plan_status, now);
        rt.updated_at = now;
        info!(session_id = %rt.session_id, status = %status, "Session finished");
        self.save(rt, now).await
    }

    async fn maybe_checkpoint(&self, rt: &mut SessionRuntime, now: DateTime<Utc>) -> Result<()> {
        let Some(interval) = self.config.checkpoint_interval() else {
            return Ok(());
        };
        let due = (now - rt.last_checkpoint)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= interval);
        if due && !rt.status.is_terminal() {
            self.save(rt, now).await?;
        }
        Ok(())
    }

    async fn save(&self, rt: &mut SessionRuntime, now: DateTime<Utc>) -> Result<()> {
        let session = rt.to_session();
        if let Err(e) = self.checkpoint.save(&rt.session_id, &session).await {
            error!(session_id = %rt.session_id, error = %e, "Checkpoint failed");
            return Err(e.into());
        }
        rt.last_checkpoint = now;
        debug!(session_id = %rt.session_id, status = %rt.status, "Checkpoint saved");
        Ok(())
    }
}

fn outcome(
    rt: &SessionRuntime,
    dispatched: Vec<TaskId>,
    strategy: Option<ExecutionStrategy>,
) -> AdvanceOutcome {
    AdvanceOutcome {
        dispatched,
        strategy,
        hitl_request: rt.pending_hitl.clone(),
        done: rt.status.is_terminal(),
        status: rt.status,
        in_flight: rt.store.state().count(TaskStatus::InProgress),
    }
}
