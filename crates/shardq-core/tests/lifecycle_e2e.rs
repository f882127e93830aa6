mod common;

use chrono::Duration;
use shardq_core::app::{EngineBuilder, PartitionScope};
use shardq_core::domain::{
    ExecResult, FailureClass, NewTask, ReindexPayload, TaskError, TaskPayload, TaskState,
    TransitionReason,
};
use shardq_core::error::QueueError;
use shardq_core::lifecycle;
use shardq_core::ports::Clock;
use shardq_core::worker::{TaskContext, handler_fn};

use common::{config, drain, start, t0};

use TaskState::{Failed, Pending, Running};

fn flaky(payload: &ReindexPayload, _: &TaskContext) -> ExecResult {
    match payload.index.as_str() {
        "offline" => Err(TaskError::recoverable("index offline")),
        "corrupt" => Err(TaskError::fatal("index corrupt")),
        _ => Ok(()),
    }
}

fn builder() -> EngineBuilder {
    EngineBuilder::new(config())
        .register::<ReindexPayload, _>(handler_fn(flaky))
        .unwrap()
}

#[tokio::test]
async fn recoverable_failures_exhaust_retries() {
    let (engine, clock) = start(builder()).await;
    let task = engine
        .producer()
        .enqueue_ref(NewTask::new("ns-1", TaskPayload::reindex("offline")).retries(3))
        .await
        .unwrap();
    let dispatcher = engine.dispatcher();
    let status = engine.status();

    assert_eq!(dispatcher.run_once(&PartitionScope::All).await.unwrap(), 1);
    let row = status.task(&task).await.unwrap().unwrap();
    assert_eq!(row.state, Pending);
    assert_eq!(row.retries_left, 2);
    assert_eq!(row.attempt, 1);
    assert_eq!(row.perform_at, t0() + Duration::seconds(2));

    // backoff not elapsed yet
    assert_eq!(dispatcher.run_once(&PartitionScope::All).await.unwrap(), 0);

    clock.advance(Duration::seconds(2));
    assert_eq!(dispatcher.run_once(&PartitionScope::All).await.unwrap(), 1);
    let row = status.task(&task).await.unwrap().unwrap();
    assert_eq!(row.retries_left, 1);
    assert_eq!(row.perform_at, t0() + Duration::seconds(6));

    clock.advance(Duration::seconds(4));
    assert_eq!(dispatcher.run_once(&PartitionScope::All).await.unwrap(), 1);
    let row = status.task(&task).await.unwrap().unwrap();
    assert_eq!(row.state, Failed);
    assert_eq!(row.retries_left, 0);
    assert_eq!(row.attempt, 3);
    assert_eq!(row.failure_class, Some(FailureClass::Recoverable));
    assert!(row.last_error.as_deref().unwrap().contains("index offline"));
    assert!(row.satisfies_retry_invariant());

    let log = status.transitions(&task).await.unwrap();
    let pairs: Vec<_> = log.iter().map(|t| t.pair()).collect();
    assert_eq!(
        pairs,
        vec![
            (Pending, Running),
            (Running, Pending),
            (Pending, Running),
            (Running, Pending),
            (Pending, Running),
            (Running, Failed),
        ]
    );
    assert_eq!(log.last().unwrap().reason, TransitionReason::RetriesExhausted);
}

#[tokio::test]
async fn fatal_failure_keeps_retries() {
    let (engine, clock) = start(builder()).await;
    let task = engine
        .producer()
        .enqueue_ref(NewTask::new("ns-1", TaskPayload::reindex("corrupt")))
        .await
        .unwrap();
    drain(&engine, &clock, 3).await;

    let row = engine.status().task(&task).await.unwrap().unwrap();
    assert_eq!(row.state, Failed);
    assert_eq!(row.retries_left, 3);
    assert_eq!(row.failure_class, Some(FailureClass::Fatal));

    let log = engine.status().transitions(&task).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].reason, TransitionReason::FatalError);
}

#[tokio::test]
async fn success_is_terminal() {
    let (engine, clock) = start(builder()).await;
    let task = engine
        .producer()
        .enqueue_ref(NewTask::new("ns-1", TaskPayload::reindex("blobs")))
        .await
        .unwrap();
    drain(&engine, &clock, 3).await;

    let row = engine.status().task(&task).await.unwrap().unwrap();
    assert_eq!(row.state, TaskState::Succeeded);
    assert_eq!(row.completed_at, Some(t0()));
    assert_eq!(row.lease_expires_at, None);

    let err = engine.producer().cancel(&task).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidTransition { .. }));
}

#[tokio::test]
async fn expired_lease_is_reaped_and_old_attempt_fenced() {
    let (engine, clock) = start(builder()).await;
    let task = engine
        .producer()
        .enqueue_ref(NewTask::new("ns-1", TaskPayload::reindex("blobs")).retries(3))
        .await
        .unwrap();
    let dispatcher = engine.dispatcher();
    let reaper = engine.reaper();

    // claimed, then the worker goes silent
    let polled = dispatcher.poll(&PartitionScope::All, 10).await.unwrap();
    assert_eq!(polled.len(), 1);
    assert!(dispatcher.claim(&polled[0]).await.unwrap());
    let abandoned = engine.status().task(&task).await.unwrap().unwrap();
    assert_eq!(abandoned.state, Running);
    assert_eq!(abandoned.lease_expires_at, Some(t0() + Duration::seconds(30)));

    assert_eq!(reaper.reap_once().await.unwrap(), 0);
    clock.advance(Duration::seconds(30));
    assert_eq!(reaper.reap_once().await.unwrap(), 1);

    let row = engine.status().task(&task).await.unwrap().unwrap();
    assert_eq!(row.state, Pending);
    assert_eq!(row.retries_left, 2);
    assert_eq!(row.failure_class, Some(FailureClass::LeaseExpired));
    let log = engine.status().transitions(&task).await.unwrap();
    assert_eq!(log.last().unwrap().reason, TransitionReason::LeaseExpired);

    // someone else picks it up
    clock.advance(Duration::minutes(1));
    let polled = dispatcher.poll(&PartitionScope::All, 10).await.unwrap();
    assert!(dispatcher.claim(&polled[0]).await.unwrap());

    // the first worker wakes up and reports success for attempt 1
    let late = lifecycle::complete(&abandoned, abandoned.attempt, clock.now()).unwrap();
    let err = engine
        .store()
        .update_state(&task, Running, late)
        .await
        .unwrap_err();
    assert!(err.is_stale());

    let row = engine.status().task(&task).await.unwrap().unwrap();
    assert_eq!(row.state, Running);
    assert_eq!(row.attempt, 2);
}

#[tokio::test]
async fn pending_task_can_be_cancelled() {
    let (engine, clock) = start(builder()).await;
    let producer = engine.producer();
    let task = producer
        .enqueue_ref(NewTask::new("ns-1", TaskPayload::reindex("blobs")))
        .await
        .unwrap();

    let row = producer.cancel(&task).await.unwrap();
    assert_eq!(row.state, TaskState::Cancelled);

    // nothing left to run
    assert_eq!(drain(&engine, &clock, 1).await, 1);
    let log = engine.status().transitions(&task).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].reason, TransitionReason::Cancelled);
}

#[tokio::test]
async fn natural_key_makes_enqueue_idempotent() {
    let (engine, _) = start(builder()).await;
    let producer = engine.producer();
    let first = producer
        .enqueue(NewTask::new("ns-1", TaskPayload::reindex("blobs")).natural_key("reindex:blobs"))
        .await
        .unwrap();
    let second = producer
        .enqueue(NewTask::new("ns-1", TaskPayload::reindex("blobs")).natural_key("reindex:blobs"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(engine.status().totals().await.unwrap().pending, 1);
}

#[tokio::test]
async fn task_without_retries_is_rejected() {
    let (engine, _) = start(builder()).await;
    let err = engine
        .producer()
        .enqueue(NewTask::new("ns-1", TaskPayload::reindex("blobs")).retries(0))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidTask(_)));
}
