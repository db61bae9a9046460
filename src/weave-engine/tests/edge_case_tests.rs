//! Edge case tests for the orchestration engine.
//!
//! Covers HITL response validation, plan edits while a session is suspended,
//! concurrency caps, crash recovery from file checkpoints and retention.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use weave_engine::{
    ChangeKind, CheckpointGateway, DependencyGraph, EngineConfig, EngineError, ExecutionContext,
    ExecutionResult, Executor, ExecutorRegistry, FileCheckpointStore, GraphError, HitlAction,
    HitlError, HitlRequestType, InMemoryCheckpointStore, InstructionInterpreter, InterruptKind,
    InterruptPoint, ManualClock, Orchestrator, Parameters, Plan, PlanEdit, Session, SessionStatus,
    Task, TaskId, TaskStatus,
};

struct Echo;

#[async_trait]
impl Executor for Echo {
    async fn invoke(&self, task: Task, _ctx: ExecutionContext) -> ExecutionResult {
        ExecutionResult::success(task.parameters)
    }
}

struct External;

#[async_trait]
impl Executor for External {
    async fn invoke(&self, _task: Task, ctx: ExecutionContext) -> ExecutionResult {
        ctx.cancel.cancelled().await;
        ExecutionResult::failure("cancelled")
    }
}

/// Appends one step after the last task, carrying the instruction text.
struct AppendStep;

#[async_trait]
impl InstructionInterpreter for AppendStep {
    async fn interpret(&self, plan: &Plan, instruction: &str) -> Result<Vec<PlanEdit>, String> {
        if instruction.contains("nonsense") {
            return Err("could not understand instruction".to_string());
        }
        let mut task = Task::new("appended", "echo").with_parameter("note", json!(instruction));
        if let Some(last) = plan.tasks.last() {
            task = task.depends_on(last.id.clone());
        }
        Ok(vec![PlanEdit::AddTask { task }])
    }
}

fn registry() -> ExecutorRegistry {
    ExecutorRegistry::new()
        .with("echo", Arc::new(Echo))
        .with("external", Arc::new(External))
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.tick_interval_ms = 5;
    config
}

fn in_memory(config: EngineConfig) -> (Orchestrator, InMemoryCheckpointStore, ManualClock) {
    let store = InMemoryCheckpointStore::new();
    let clock = ManualClock::new(Utc::now());
    let engine = Orchestrator::new(config, registry(), Arc::new(store.clone()))
        .with_clock(Arc::new(clock.clone()));
    (engine, store, clock)
}

fn status_of(session: &Session, id: &str) -> TaskStatus {
    session.execution_state.tasks_by_id[&TaskId::from(id)].status
}

fn has_entry(session: &Session, pred: impl Fn(&ChangeKind) -> bool) -> bool {
    session.plan.change_log.iter().any(|e| pred(&e.kind))
}

// ============================================================================
// HITL RESPONSE EDGE CASES
// ============================================================================

mod hitl_response_edge_cases {
    use super::*;

    #[tokio::test]
    async fn test_respond_without_pending_request() {
        let (engine, _, _) = in_memory(test_config());
        let plan = engine
            .create_plan(vec![Task::new("a", "echo")], &DependencyGraph::new())
            .unwrap();
        let id = engine.start_session(plan).await.unwrap();

        let err = engine
            .respond_to_hitl(&id, "nothing", HitlAction::Approve)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Hitl(HitlError::NoPendingRequest(_))));
    }

    #[tokio::test]
    async fn test_mismatched_request_id_keeps_request_pending() {
        let (engine, _, _) = in_memory(test_config());
        let plan = engine
            .create_plan(
                vec![Task::new("gate", "echo")
                    .with_interrupt(InterruptPoint::new(InterruptKind::Approval, "Go?"))],
                &DependencyGraph::new(),
            )
            .unwrap();
        let id = engine.start_session(plan).await.unwrap();
        let request = engine.advance(&id).await.unwrap().hitl_request.unwrap();
        assert_eq!(request.request_type, HitlRequestType::Approval);

        let err = engine
            .respond_to_hitl(&id, "bogus", HitlAction::Approve)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Hitl(HitlError::RequestMismatch { .. })
        ));

        let session = engine.session(&id).await.unwrap();
        let pending = session.pending_hitl.as_ref().unwrap();
        assert_eq!(pending.request_id, request.request_id);
        assert_eq!(pending.timeout_at, request.timeout_at);
        assert!(has_entry(&session, |k| matches!(
            k,
            ChangeKind::HitlResponseRejected { .. }
        )));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (engine, _, _) = in_memory(test_config());
        assert!(matches!(
            engine.advance("missing").await,
            Err(EngineError::SessionNotFound(_))
        ));
        assert!(matches!(
            engine.pause("missing").await,
            Err(EngineError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_second_interrupt_waits_for_the_first() {
        let (engine, _, _) = in_memory(test_config());
        let plan = engine
            .create_plan(
                vec![
                    Task::new("first", "echo")
                        .with_priority(2)
                        .with_interrupt(InterruptPoint::new(InterruptKind::Approval, "One?")),
                    Task::new("second", "echo")
                        .with_interrupt(InterruptPoint::new(InterruptKind::Approval, "Two?")),
                ],
                &DependencyGraph::new(),
            )
            .unwrap();
        let id = engine.start_session(plan).await.unwrap();

        let first = engine.advance(&id).await.unwrap().hitl_request.unwrap();
        assert_eq!(first.task_id, Some(TaskId::from("first")));
        let session = engine.session(&id).await.unwrap();
        assert_eq!(status_of(&session, "second"), TaskStatus::Pending);

        engine
            .respond_to_hitl(&id, &first.request_id, HitlAction::Approve)
            .await
            .unwrap();
        let second = engine.advance(&id).await.unwrap().hitl_request.unwrap();
        assert_eq!(second.task_id, Some(TaskId::from("second")));
        assert_ne!(second.request_id, first.request_id);
    }

    #[tokio::test]
    async fn test_waiting_interrupts_do_not_starve_other_tasks() {
        let (engine, _, _) = in_memory(test_config().with_max_parallel(1));
        let plan = engine
            .create_plan(
                vec![
                    Task::new("h1", "echo")
                        .with_priority(10)
                        .with_interrupt(InterruptPoint::new(InterruptKind::Approval, "One?")),
                    Task::new("h2", "echo")
                        .with_priority(9)
                        .with_interrupt(InterruptPoint::new(InterruptKind::Approval, "Two?")),
                    Task::new("r", "echo"),
                ],
                &DependencyGraph::new(),
            )
            .unwrap();
        let id = engine.start_session(plan).await.unwrap();

        let step = engine.advance(&id).await.unwrap();
        assert_eq!(
            step.hitl_request.unwrap().task_id,
            Some(TaskId::from("h1"))
        );
        assert_eq!(step.dispatched, vec![TaskId::from("r")]);

        let session = engine.run_until_settled(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::AwaitingHuman);
        assert_eq!(status_of(&session, "h1"), TaskStatus::NeedsApproval);
        assert_eq!(status_of(&session, "h2"), TaskStatus::Pending);
        assert_eq!(status_of(&session, "r"), TaskStatus::Completed);
    }
}

// ============================================================================
// PLAN EDIT EDGE CASES
// ============================================================================

mod plan_edit_edge_cases {
    use super::*;

    async fn reviewed_session(engine: &Orchestrator) -> (String, String) {
        let plan = engine
            .create_plan(
                vec![
                    Task::new("a", "echo"),
                    Task::new("b", "echo").depends_on("a"),
                    Task::new("c", "echo"),
                ],
                &DependencyGraph::new(),
            )
            .unwrap();
        let id = engine.start_session(plan).await.unwrap();
        let request = engine.session(&id).await.unwrap().pending_hitl.unwrap();
        (id, request.request_id)
    }

    #[tokio::test]
    async fn test_cascade_removal_cancels_removed_tasks() {
        let (engine, _, _) = in_memory(test_config().with_plan_review(true));
        let (id, request_id) = reviewed_session(&engine).await;

        let plan = engine
            .respond_to_hitl(
                &id,
                &request_id,
                HitlAction::Modify {
                    edits: vec![PlanEdit::RemoveTask {
                        id: "a".into(),
                        cascade: true,
                    }],
                },
            )
            .await
            .unwrap();
        assert_eq!(plan.tasks.len(), 1);

        let session = engine.run_until_settled(&id).await.unwrap();
        assert_eq!(status_of(&session, "a"), TaskStatus::Cancelled);
        assert_eq!(status_of(&session, "b"), TaskStatus::Cancelled);
        assert_eq!(status_of(&session, "c"), TaskStatus::Completed);
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_removal_with_dependents_is_rejected() {
        let (engine, _, _) = in_memory(test_config().with_plan_review(true));
        let (id, request_id) = reviewed_session(&engine).await;

        let err = engine
            .respond_to_hitl(
                &id,
                &request_id,
                HitlAction::Modify {
                    edits: vec![PlanEdit::RemoveTask {
                        id: "a".into(),
                        cascade: false,
                    }],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Graph(GraphError::DanglingDependency { .. })
        ));

        let session = engine.session(&id).await.unwrap();
        assert_eq!(session.plan.version, 1);
        assert_eq!(session.pending_hitl.unwrap().request_id, request_id);
        assert_eq!(session.execution_state.tasks_by_id.len(), 3);
    }

    #[tokio::test]
    async fn test_instruction_goes_through_interpreter() {
        let config = test_config().with_plan_review(true);
        let store = InMemoryCheckpointStore::new();
        let engine = Orchestrator::new(config, registry(), Arc::new(store))
            .with_interpreter(Arc::new(AppendStep));
        let (id, request_id) = reviewed_session(&engine).await;

        let err = engine
            .respond_to_hitl(
                &id,
                &request_id,
                HitlAction::Instruct {
                    instruction: "nonsense please".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("could not understand"));

        let plan = engine
            .respond_to_hitl(
                &id,
                &request_id,
                HitlAction::Instruct {
                    instruction: "add a final check".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(plan.contains(&"appended".into()));

        let session = engine.run_until_settled(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        let result = &session.execution_state.results_by_task_id[&TaskId::from("appended")];
        assert_eq!(result.data["note"], json!("add a final check"));
    }

    #[tokio::test]
    async fn test_update_changes_pending_definition() {
        let (engine, _, _) = in_memory(test_config().with_plan_review(true));
        let (id, request_id) = reviewed_session(&engine).await;

        let mut parameters = Parameters::new();
        parameters.insert("mode".to_string(), json!("fast"));
        engine
            .respond_to_hitl(
                &id,
                &request_id,
                HitlAction::Modify {
                    edits: vec![PlanEdit::UpdateTask {
                        id: "c".into(),
                        tool: None,
                        parameters: Some(parameters),
                        priority: Some(9),
                        max_retries: None,
                    }],
                },
            )
            .await
            .unwrap();

        let step = engine.advance(&id).await.unwrap();
        assert_eq!(step.dispatched[0], TaskId::from("c"));

        let session = engine.run_until_settled(&id).await.unwrap();
        let result = &session.execution_state.results_by_task_id[&TaskId::from("c")];
        assert_eq!(result.data["mode"], json!("fast"));
    }
}

// ============================================================================
// DISPATCH EDGE CASES
// ============================================================================

mod dispatch_edge_cases {
    use super::*;

    #[tokio::test]
    async fn test_parallel_cap_limits_in_flight_tasks() {
        let (engine, _, _) = in_memory(test_config().with_max_parallel(1));
        let plan = engine
            .create_plan(
                vec![
                    Task::new("low", "external"),
                    Task::new("high", "external").with_priority(5),
                    Task::new("mid", "external").with_priority(1),
                ],
                &DependencyGraph::new(),
            )
            .unwrap();
        let id = engine.start_session(plan).await.unwrap();

        let step = engine.advance(&id).await.unwrap();
        assert_eq!(step.dispatched, vec![TaskId::from("high")]);
        assert_eq!(step.in_flight, 1);

        let again = engine.advance(&id).await.unwrap();
        assert!(again.dispatched.is_empty());

        engine
            .submit_task_result(&id, &"high".into(), ExecutionResult::success(Parameters::new()))
            .await
            .unwrap();
        let step = engine.advance(&id).await.unwrap();
        assert_eq!(step.dispatched, vec![TaskId::from("mid")]);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_task() {
        let (engine, _, _) = in_memory(test_config());
        let plan = engine
            .create_plan(vec![Task::new("a", "teleport")], &DependencyGraph::new())
            .unwrap();
        let id = engine.start_session(plan).await.unwrap();

        let session = engine.run_until_settled(&id).await.unwrap();
        let a = &session.execution_state.tasks_by_id[&TaskId::from("a")];
        assert_eq!(a.status, TaskStatus::Failed);
        assert!(a.error_message.as_deref().unwrap().contains("teleport"));
        assert_eq!(session.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_default_retries_apply_to_undeclared_tasks() {
        let (engine, _, _) = in_memory(test_config().with_default_max_retries(3));
        let plan = engine
            .create_plan(
                vec![Task::new("a", "echo"), Task::new("b", "echo").with_max_retries(1)],
                &DependencyGraph::new(),
            )
            .unwrap();
        assert_eq!(plan.task(&"a".into()).unwrap().max_retries, 3);
        assert_eq!(plan.task(&"b".into()).unwrap().max_retries, 1);
    }

    #[tokio::test]
    async fn test_terminal_session_rejects_control() {
        let (engine, _, _) = in_memory(test_config());
        let plan = engine
            .create_plan(vec![Task::new("a", "echo")], &DependencyGraph::new())
            .unwrap();
        let id = engine.start_session(plan).await.unwrap();
        engine.run_until_settled(&id).await.unwrap();

        assert!(matches!(
            engine.pause(&id).await,
            Err(EngineError::SessionTerminal(_))
        ));
        let step = engine.advance(&id).await.unwrap();
        assert!(step.done);
        assert!(step.dispatched.is_empty());
    }
}

// ============================================================================
// PERSISTENCE EDGE CASES
// ============================================================================

mod persistence_edge_cases {
    use super::*;

    #[tokio::test]
    async fn test_restore_suspended_session_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config().with_plan_review(true);

        let id = {
            let store = FileCheckpointStore::new(dir.path());
            let engine = Orchestrator::new(config.clone(), registry(), Arc::new(store));
            let plan = engine
                .create_plan(
                    vec![Task::new("a", "echo"), Task::new("b", "echo").depends_on("a")],
                    &DependencyGraph::new(),
                )
                .unwrap();
            engine.start_session(plan).await.unwrap()
        };

        let store = FileCheckpointStore::new(dir.path());
        let engine = Orchestrator::new(config, registry(), Arc::new(store.clone()));
        engine.restore_session(&id).await.unwrap();

        let request = engine.session(&id).await.unwrap().pending_hitl.unwrap();
        assert_eq!(request.request_type, HitlRequestType::PlanReview);
        engine
            .respond_to_hitl(&id, &request.request_id, HitlAction::Approve)
            .await
            .unwrap();

        let session = engine.run_until_settled(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);

        let saved = store.load(&id).await.unwrap().unwrap();
        assert_eq!(saved.status, SessionStatus::Completed);
        assert_eq!(saved.hitl_history.len(), 1);
    }

    #[tokio::test]
    async fn test_answered_request_is_checkpointed() {
        let (engine, store, _) = in_memory(test_config().with_plan_review(true));
        let plan = engine
            .create_plan(vec![Task::new("a", "external")], &DependencyGraph::new())
            .unwrap();
        let id = engine.start_session(plan).await.unwrap();

        let request = engine.session(&id).await.unwrap().pending_hitl.unwrap();
        engine
            .respond_to_hitl(&id, &request.request_id, HitlAction::Approve)
            .await
            .unwrap();

        let saved = store.load(&id).await.unwrap().unwrap();
        assert!(saved.pending_hitl.is_none());
        assert_eq!(saved.hitl_history.len(), 1);
        assert_eq!(saved.status, SessionStatus::Running);

        let other = Orchestrator::new(test_config(), registry(), Arc::new(store));
        other.restore_session(&id).await.unwrap();
        let restored = other.session(&id).await.unwrap();
        assert!(restored.pending_hitl.is_none());
        assert!(matches!(
            other
                .respond_to_hitl(&id, &request.request_id, HitlAction::Approve)
                .await,
            Err(EngineError::Hitl(HitlError::AlreadyTerminal(_)))
        ));
    }

    #[tokio::test]
    async fn test_resume_is_checkpointed() {
        let (engine, store, _) = in_memory(test_config());
        let plan = engine
            .create_plan(vec![Task::new("a", "external")], &DependencyGraph::new())
            .unwrap();
        let id = engine.start_session(plan).await.unwrap();

        engine.pause(&id).await.unwrap();
        assert_eq!(
            store.load(&id).await.unwrap().unwrap().status,
            SessionStatus::Paused
        );

        engine.resume(&id).await.unwrap();
        assert_eq!(
            store.load(&id).await.unwrap().unwrap().status,
            SessionStatus::Running
        );
    }

    #[tokio::test]
    async fn test_restore_twice_is_rejected() {
        let (engine, store, _) = in_memory(test_config());
        let plan = engine
            .create_plan(vec![Task::new("a", "external")], &DependencyGraph::new())
            .unwrap();
        let id = engine.start_session(plan).await.unwrap();

        let other = Orchestrator::new(test_config(), registry(), Arc::new(store));
        other.restore_session(&id).await.unwrap();
        assert!(matches!(
            other.restore_session(&id).await,
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_purge_drops_only_expired_finished_sessions() {
        let (engine, store, clock) = in_memory(test_config());
        let plan = engine
            .create_plan(vec![Task::new("a", "echo")], &DependencyGraph::new())
            .unwrap();
        let done = engine.start_session(plan).await.unwrap();
        engine.run_until_settled(&done).await.unwrap();

        let plan = engine
            .create_plan(vec![Task::new("a", "external")], &DependencyGraph::new())
            .unwrap();
        let open = engine.start_session(plan).await.unwrap();

        clock.advance(Duration::hours(24));
        assert_eq!(engine.purge_finished().await.unwrap(), 0);

        clock.advance(engine.config().retention());
        assert_eq!(engine.purge_finished().await.unwrap(), 1);
        assert_eq!(engine.session_ids().await, vec![open.clone()]);
        assert!(store.load(&done).await.unwrap().is_none());
        assert!(store.load(&open).await.unwrap().is_some());
    }
}
