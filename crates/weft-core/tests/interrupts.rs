mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use common::{ACK_TIMEOUT_MS, Harness, pipeline};
use serde_json::json;
use weft_core::engine::InterruptError;
use weft_core::repository::WaitNotifyRepository;
use weft_core::task_queue::{InMemoryTaskQueue, TaskDispatcher, TaskQueueError};
use weft_types::advise::AdviserResponse;
use weft_types::event::OrchestrationEvent;
use weft_types::execution::{FailureType, Status};
use weft_types::interrupt::{InterruptConfig, InterruptKind, InterruptState, IssuedBy};
use weft_types::task::TaskDescriptor;

fn user() -> InterruptConfig {
    InterruptConfig::issued_by(IssuedBy::User)
}

/// Queue whose `abort` never confirms a cancellation.
struct UnconfirmedAbort {
    inner: InMemoryTaskQueue,
    unavailable: bool,
}

impl TaskDispatcher for UnconfirmedAbort {
    async fn enqueue(&self, descriptor: TaskDescriptor) -> Result<String, TaskQueueError> {
        self.inner.enqueue(descriptor).await
    }

    async fn abort(&self, _task_id: &str) -> Result<bool, TaskQueueError> {
        if self.unavailable {
            return Err(TaskQueueError::Unavailable("executor offline".to_string()));
        }
        Ok(false)
    }
}

#[tokio::test]
async fn abort_task_step_cancels_dispatched_task() {
    let h = Harness::new();
    let pe = h
        .run(pipeline(json!([
            { "step": { "identifier": "remote", "type": "Dispatch", "spec": { "script": "sleep 60" } } }
        ])))
        .await;

    let waiting = h
        .wait_for_record(pe, "remote", |r| r.status == Status::TaskWaiting)
        .await;
    let task_id = h.queue.pending_ids().pop().unwrap();

    let interrupt = h
        .engine
        .abort(pe, waiting.id, user().with_reason("stop"))
        .await
        .unwrap();
    assert_eq!(interrupt.kind, InterruptKind::Abort);
    assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);

    let aborted = h.engine.node_execution(waiting.id).await.unwrap().unwrap();
    assert_eq!(aborted.status, Status::Aborted);
    assert_eq!(aborted.interrupt_history.len(), 1);
    assert_eq!(aborted.failure_info.unwrap().message, "stop");
    assert!(h.queue.was_aborted(&task_id));
    assert_eq!(h.aborts.load(Ordering::SeqCst), 1);

    // The executor's late result changes nothing.
    h.engine.deliver(&task_id, json!({ "exit_code": 0 }), false).await;
    assert_eq!(h.wait_for_end(pe).await, Status::Aborted);
    let after = h.engine.node_execution(waiting.id).await.unwrap().unwrap();
    assert_eq!(after.status, Status::Aborted);
}

#[tokio::test]
async fn terminal_records_cannot_be_interrupted() {
    let h = Harness::new();
    let pe = h
        .run(pipeline(json!([ { "step": { "identifier": "ok", "type": "Succeed" } } ])))
        .await;
    assert_eq!(h.wait_for_end(pe).await, Status::Succeeded);

    let ok = h.record(pe, "ok").await.unwrap();
    let err = h.engine.abort(pe, ok.id, user()).await.unwrap_err();
    assert!(matches!(err, InterruptError::AlreadyTerminal { .. }));

    let record = h.engine.node_execution(ok.id).await.unwrap().unwrap();
    assert_eq!(record.status, Status::Succeeded);
    assert!(record.interrupt_history.is_empty());

    let interrupts = h.engine.interrupts(pe).await.unwrap();
    assert_eq!(interrupts.len(), 1);
    assert_eq!(interrupts[0].state, InterruptState::ProcessedUnsuccessfully);
}

#[tokio::test]
async fn interrupt_for_unknown_plan_execution_is_rejected() {
    let h = Harness::new();
    let err = h
        .engine
        .abort_all(uuid::Uuid::now_v7(), user())
        .await
        .unwrap_err();
    assert!(matches!(err, InterruptError::UnknownPlanExecution(_)));
}

#[tokio::test]
async fn expire_and_end_execution_ends_whole_tree() {
    let h = Harness::new();
    let pe = h
        .run(pipeline(json!([
            { "step": { "identifier": "wait", "type": "Callbacks", "spec": { "ids": ["never"] } } }
        ])))
        .await;
    let waiting = h
        .wait_for_record(pe, "wait", |r| r.status == Status::AsyncWaiting)
        .await;

    h.engine
        .expire(pe, waiting.id, user().ending_execution())
        .await
        .unwrap();

    let records = h.engine.node_executions(pe).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == Status::Expired));
    let plan = h.engine.plan_execution(pe).await.unwrap().unwrap();
    assert_eq!(plan.status, Status::Expired);
    assert!(plan.end_ts.is_some());
}

#[tokio::test]
async fn abort_all_stops_every_branch() {
    let h = Harness::new();
    let pe = h
        .run(pipeline(json!([
            { "parallel": { "identifier": "fork", "branches": [
                { "step": { "identifier": "left", "type": "Callbacks", "spec": { "ids": ["l"] } } },
                { "step": { "identifier": "right", "type": "Callbacks", "spec": { "ids": ["r"] } } }
            ] } }
        ])))
        .await;
    h.wait_for_record(pe, "left", |r| r.status == Status::AsyncWaiting)
        .await;
    h.wait_for_record(pe, "right", |r| r.status == Status::AsyncWaiting)
        .await;

    h.engine.abort_all(pe, user()).await.unwrap();

    assert_eq!(h.wait_for_end(pe).await, Status::Aborted);
    for identifier in ["left", "right", "fork", "s", "p"] {
        let record = h.record(pe, identifier).await.unwrap();
        assert_eq!(record.status, Status::Aborted, "{identifier}");
    }
    assert_eq!(h.resumes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn operator_retry_resumes_parked_step() {
    let h = Harness::new();
    let pe = h
        .run(pipeline(json!([
            { "step": {
                "identifier": "flaky",
                "type": "Flaky",
                "failure_strategies": [
                    { "on_failure": { "errors": ["ALL_ERRORS"], "action": { "type": "MANUAL_INTERVENTION" } } }
                ]
            } },
            { "step": { "identifier": "after", "type": "Succeed" } }
        ])))
        .await;

    let parked = h
        .wait_for_record(pe, "flaky", |r| r.status == Status::InterventionWaiting)
        .await;
    assert_eq!(parked.intervention_prior_status, Some(Status::Failed));

    h.engine.retry(pe, parked.id, user()).await.unwrap();
    assert_eq!(h.wait_for_end(pe).await, Status::Succeeded);

    let old = h.engine.node_execution(parked.id).await.unwrap().unwrap();
    assert_eq!(old.status, Status::Failed);
    assert!(old.retried_by.is_some());
    assert_eq!(h.records(pe, "flaky").await.len(), 2);
    assert_eq!(h.record(pe, "after").await.unwrap().status, Status::Succeeded);

    // An attempt can only be retried once.
    let err = h.engine.retry(pe, parked.id, user()).await.unwrap_err();
    assert!(matches!(err, InterruptError::AlreadyRetried(_)));
}

#[tokio::test]
async fn fail_all_marks_active_leaves_failed() {
    let h = Harness::new();
    let pe = h
        .run(pipeline(json!([
            { "step": { "identifier": "wait", "type": "Callbacks", "spec": { "ids": ["never"] } } }
        ])))
        .await;
    h.wait_for_record(pe, "wait", |r| r.status == Status::AsyncWaiting)
        .await;

    h.engine
        .fail_all(pe, user().with_reason("operator gave up"))
        .await
        .unwrap();

    assert_eq!(h.wait_for_end(pe).await, Status::Failed);
    let wait = h.record(pe, "wait").await.unwrap();
    assert_eq!(wait.status, Status::Failed);
    assert_eq!(wait.failure_info.unwrap().message, "operator gave up");
}

#[tokio::test]
async fn abort_waits_for_executor_acknowledgement() {
    let h = Harness::new();
    let pe = h
        .run(pipeline(json!([
            { "step": { "identifier": "wait", "type": "Callbacks", "spec": { "ids": ["never"] } } }
        ])))
        .await;
    let waiting = h
        .wait_for_record(pe, "wait", |r| r.status == Status::AsyncWaiting)
        .await;

    let id = waiting.id;
    let mut events = h.engine.subscribe();
    let engine = Arc::clone(&h.engine);
    let abort = tokio::spawn(async move { engine.abort(pe, id, user()).await });

    let ack_correlation_id = loop {
        if let OrchestrationEvent::AbortRequested {
            node_execution_id,
            ack_correlation_id,
        } = events.recv().await.unwrap()
            && node_execution_id == id
        {
            break ack_correlation_id;
        }
    };

    // The executor is still stopping its work.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!abort.is_finished());
    let pending = h.engine.node_execution(waiting.id).await.unwrap().unwrap();
    assert_eq!(pending.status, Status::AsyncWaiting);

    let acked_at = Instant::now();
    assert_eq!(
        h.engine
            .deliver(&ack_correlation_id, json!({ "stopped": true }), false)
            .await,
        1
    );
    let interrupt = abort.await.unwrap().unwrap();
    assert!(acked_at.elapsed() < Duration::from_millis(ACK_TIMEOUT_MS));
    assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);

    let aborted = h.engine.node_execution(waiting.id).await.unwrap().unwrap();
    assert_eq!(aborted.status, Status::Aborted);
    assert_eq!(aborted.interrupt_history.len(), 1);
    assert_eq!(h.wait_for_end(pe).await, Status::Aborted);
    assert!(h.repo.list_unfired_waits().await.unwrap().is_empty());
}

#[tokio::test]
async fn unacknowledged_abort_finalizes_after_timeout() {
    let h = Harness::new();
    let pe = h
        .run(pipeline(json!([
            { "step": { "identifier": "wait", "type": "Callbacks", "spec": { "ids": ["late"] } } }
        ])))
        .await;
    let waiting = h
        .wait_for_record(pe, "wait", |r| r.status == Status::AsyncWaiting)
        .await;

    let mut events = h.engine.subscribe();
    let started = Instant::now();
    h.engine.abort(pe, waiting.id, user()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(ACK_TIMEOUT_MS));

    let aborted = h.engine.node_execution(waiting.id).await.unwrap().unwrap();
    assert_eq!(aborted.status, Status::Aborted);
    assert_eq!(aborted.interrupt_history.len(), 1);

    // Neither the acknowledgement nor the step's own callback fires anything.
    let ack_correlation_id = loop {
        if let OrchestrationEvent::AbortRequested {
            ack_correlation_id, ..
        } = events.recv().await.unwrap()
        {
            break ack_correlation_id;
        }
    };
    assert_eq!(h.engine.deliver(&ack_correlation_id, json!({}), false).await, 0);
    assert_eq!(h.engine.deliver("late", json!({}), false).await, 0);
    assert_eq!(h.resumes.load(Ordering::SeqCst), 0);
    assert_eq!(h.wait_for_end(pe).await, Status::Aborted);
    assert!(h.repo.list_unfired_waits().await.unwrap().is_empty());
}

#[tokio::test]
async fn unconfirmed_task_abort_still_aborts_node() {
    for unavailable in [false, true] {
        let h = Harness::with_dispatcher(Arc::new(UnconfirmedAbort {
            inner: InMemoryTaskQueue::new(),
            unavailable,
        }));
        let pe = h
            .run(pipeline(json!([
                { "step": { "identifier": "remote", "type": "Dispatch", "spec": { "script": "sleep 60" } } }
            ])))
            .await;
        let waiting = h
            .wait_for_record(pe, "remote", |r| r.status == Status::TaskWaiting)
            .await;

        let interrupt = h.engine.abort(pe, waiting.id, user()).await.unwrap();
        assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully, "unavailable={unavailable}");

        let aborted = h.engine.node_execution(waiting.id).await.unwrap().unwrap();
        assert_eq!(aborted.status, Status::Aborted, "unavailable={unavailable}");
        assert_eq!(aborted.interrupt_history.len(), 1);
        assert_eq!(h.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(h.wait_for_end(pe).await, Status::Aborted);
    }
}

#[tokio::test]
async fn expire_and_end_on_stage_skips_acknowledgement() {
    let h = Harness::new();
    let pe = h
        .run(pipeline(json!([
            { "step": { "identifier": "wait", "type": "Callbacks", "spec": { "ids": ["never"] } } }
        ])))
        .await;
    h.wait_for_record(pe, "wait", |r| r.status == Status::AsyncWaiting)
        .await;
    let stage = h.record(pe, "s").await.unwrap();
    assert!(stage.execution_mode.is_parent());

    let mut events = h.engine.subscribe();
    let started = Instant::now();
    h.engine
        .expire(pe, stage.id, user().ending_execution())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(ACK_TIMEOUT_MS));

    let records = h.engine.node_executions(pe).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == Status::Expired));
    assert!(records.iter().all(|r| r.interrupt_history.len() == 1));
    let plan = h.engine.plan_execution(pe).await.unwrap().unwrap();
    assert_eq!(plan.status, Status::Expired);

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(
                event,
                OrchestrationEvent::ExpireRequested { .. } | OrchestrationEvent::AbortRequested { .. }
            ),
            "unexpected {event:?}"
        );
    }
    assert!(h.repo.list_unfired_waits().await.unwrap().is_empty());
}

#[tokio::test]
async fn fail_all_consults_failure_strategies() {
    let h = Harness::new();
    let pe = h
        .run(pipeline(json!([
            { "step": {
                "identifier": "wait",
                "type": "Callbacks",
                "spec": { "ids": ["never"] },
                "failure_strategies": [
                    { "on_failure": { "errors": ["ALL_ERRORS"], "action": { "type": "RETRY", "spec": { "retry_count": 2 } } } },
                    { "on_failure": { "errors": ["USER_MARKED_FAILURE"], "action": { "type": "MARK_SUCCESS" } } }
                ]
            } },
            { "step": { "identifier": "after", "type": "Succeed" } }
        ])))
        .await;
    h.wait_for_record(pe, "wait", |r| r.status == Status::AsyncWaiting)
        .await;

    h.engine.fail_all(pe, user()).await.unwrap();

    assert_eq!(h.wait_for_end(pe).await, Status::Succeeded);
    let wait = h.record(pe, "wait").await.unwrap();
    assert_eq!(wait.status, Status::Failed);
    assert!(wait.failure_info.unwrap().has_type(FailureType::UserMarkedFailure));
    assert!(matches!(
        wait.adviser_response,
        Some(AdviserResponse::MarkSuccess { next_node_id: Some(_) })
    ));
    assert_eq!(h.records(pe, "wait").await.len(), 1);
    assert_eq!(h.record(pe, "after").await.unwrap().status, Status::Succeeded);
}
