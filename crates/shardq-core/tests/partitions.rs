mod common;

use std::sync::{Arc, Mutex};

use chrono::{Duration, NaiveDate};
use shardq_core::app::{EngineBuilder, PartitionScope};
use shardq_core::config::{EngineConfig, PartitionConfig};
use shardq_core::domain::{
    NewTask, PartitionId, PartitionKey, ReindexPayload, TaskPayload, TaskState,
};
use shardq_core::error::QueueError;
use shardq_core::partition::PartitionScheme;
use shardq_core::worker::{TaskContext, handler_fn};

use common::{config, start};

type Seen = Arc<Mutex<Vec<PartitionId>>>;

fn recording(config: EngineConfig, seen: Seen) -> EngineBuilder {
    EngineBuilder::new(config)
        .register::<ReindexPayload, _>(handler_fn(move |_: &ReindexPayload, ctx: &TaskContext| {
            seen.lock().unwrap().push(ctx.partition.clone());
            Ok(())
        }))
        .unwrap()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[tokio::test]
async fn dispatcher_scope_limits_what_it_runs() {
    let seen = Seen::default();
    let (engine, _) = start(recording(config(), seen.clone())).await;
    let producer = engine.producer();

    let a = producer
        .enqueue_ref(NewTask::new("ns-a", TaskPayload::reindex("a")))
        .await
        .unwrap();
    // find a key that hashes elsewhere
    let other_key = (0..100)
        .map(|n| PartitionKey::text(format!("ns-{n}")))
        .find(|key| engine.router().partition_for(key).unwrap() != a.partition)
        .unwrap();
    let b = producer
        .enqueue_ref(NewTask::new(other_key, TaskPayload::reindex("b")))
        .await
        .unwrap();
    assert_ne!(a.partition, b.partition);

    let scoped = engine.dispatcher();
    let only_a = PartitionScope::Only(vec![a.partition.clone()]);
    assert_eq!(scoped.run_once(&only_a).await.unwrap(), 1);
    assert_eq!(scoped.run_once(&only_a).await.unwrap(), 0);

    assert_eq!(*seen.lock().unwrap(), vec![a.partition.clone()]);
    let status = engine.status();
    assert_eq!(status.task(&a).await.unwrap().unwrap().state, TaskState::Succeeded);
    assert_eq!(status.task(&b).await.unwrap().unwrap().state, TaskState::Pending);

    let per_partition = status.partition_counts().await.unwrap();
    let b_counts = per_partition
        .iter()
        .find(|s| s.partition == b.partition)
        .unwrap();
    assert_eq!(b_counts.counts.pending, 1);
    assert_eq!(b_counts.counts.succeeded, 0);
}

#[tokio::test]
async fn hash_routing_is_stable() {
    let (engine, _) = start(recording(config(), Seen::default())).await;
    let key = PartitionKey::text("ns-42");
    let first = engine.router().partition_for(&key).unwrap();
    for _ in 0..10 {
        assert_eq!(engine.router().partition_for(&key).unwrap(), first);
    }
    assert!(first.as_str().starts_with("tasks_"));
    assert_eq!(first.as_str().len(), "tasks_00".len());
}

#[tokio::test]
async fn date_partitions_fail_closed_and_detach() {
    let mut config = config();
    config.partition = PartitionConfig::daily("events", 3);
    let (engine, clock) = start(recording(config, Seen::default())).await;
    let producer = engine.producer();

    let mut attached = engine.catalog().partitions().await.unwrap();
    attached.sort();
    assert_eq!(
        attached,
        vec![
            PartitionId::new("events", "20240517"),
            PartitionId::new("events", "20240518"),
            PartitionId::new("events", "20240519"),
        ]
    );

    let today = producer
        .enqueue_ref(NewTask::new(date(2024, 5, 17), TaskPayload::reindex("a")))
        .await
        .unwrap();
    assert_eq!(today.partition, PartitionId::new("events", "20240517"));

    // beyond the horizon
    let err = producer
        .enqueue(NewTask::new(date(2024, 5, 20), TaskPayload::reindex("b")))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::PartitionRoutingFailure { .. }));

    // wrong key type for the scheme
    let err = producer
        .enqueue(NewTask::new("ns-1", TaskPayload::reindex("c")))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::PartitionRoutingFailure { .. }));

    let detached = engine.router().detach_before(date(2024, 5, 18)).await.unwrap();
    assert_eq!(detached, vec![PartitionId::new("events", "20240517")]);

    let err = producer
        .enqueue(NewTask::new(date(2024, 5, 17), TaskPayload::reindex("d")))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::PartitionRoutingFailure { .. }));
    // archived rows stay readable
    let row = engine.status().task(&today).await.unwrap().unwrap();
    assert_eq!(row.state, TaskState::Pending);

    clock.advance(Duration::days(2));
    let created = engine.initialize().await.unwrap();
    assert_eq!(
        created,
        vec![
            PartitionId::new("events", "20240520"),
            PartitionId::new("events", "20240521"),
        ]
    );
}

#[tokio::test]
async fn integer_ranges_cover_blocks() {
    let mut config = config();
    config.partition = PartitionConfig {
        table: "docs".into(),
        scheme: PartitionScheme::IntegerRange { block_size: 1000 },
        horizon: 2,
    };
    let (engine, _) = start(recording(config, Seen::default())).await;
    let producer = engine.producer();

    let task = producer
        .enqueue_ref(NewTask::new(1500_i64, TaskPayload::reindex("a")))
        .await
        .unwrap();
    assert_eq!(task.partition, PartitionId::new("docs", "000000001000"));

    for key in [-1_i64, 5000] {
        let err = producer
            .enqueue(NewTask::new(key, TaskPayload::reindex("b")))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::PartitionRoutingFailure { .. }), "{key}");
    }

    // the highest used block is now 1000, so maintenance extends to 3000
    let created = engine.initialize().await.unwrap();
    assert_eq!(created, vec![PartitionId::new("docs", "000000003000")]);
}

#[tokio::test]
async fn reaper_recovers_tasks_in_detached_partitions() {
    let mut config = config();
    config.partition = PartitionConfig::daily("events", 2);
    let (engine, clock) = start(recording(config, Seen::default())).await;

    let task = engine
        .producer()
        .enqueue_ref(NewTask::new(date(2024, 5, 17), TaskPayload::reindex("a")))
        .await
        .unwrap();
    let dispatcher = engine.dispatcher();
    let polled = dispatcher.poll(&PartitionScope::All, 1).await.unwrap();
    assert_eq!(polled.len(), 1);
    assert!(dispatcher.claim(&polled[0]).await.unwrap());

    // archived while the worker is gone
    engine.router().detach_before(date(2024, 5, 18)).await.unwrap();
    clock.advance(Duration::minutes(5));

    assert_eq!(engine.reaper().reap_once().await.unwrap(), 1);
    let row = engine.status().task(&task).await.unwrap().unwrap();
    assert_eq!(row.state, TaskState::Pending);
    assert_eq!(row.attempt, 1);
    assert_eq!(row.retries_left, 2);
}
