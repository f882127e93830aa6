mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use shardq_core::app::{EngineBuilder, PartitionScope};
use shardq_core::domain::{NewTask, ReindexPayload, TaskId, TaskPayload, TaskState};
use shardq_core::worker::{TaskContext, handler_fn};

use common::{config, start};

type Executions = Arc<Mutex<HashMap<TaskId, u32>>>;

fn counting(executions: Executions) -> EngineBuilder {
    EngineBuilder::new(config())
        .register::<ReindexPayload, _>(handler_fn(move |_: &ReindexPayload, ctx: &TaskContext| {
            *executions.lock().unwrap().entry(ctx.task_id).or_default() += 1;
            Ok(())
        }))
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_claims_have_one_winner() {
    let (engine, _) = start(counting(Executions::default())).await;
    let task = engine
        .producer()
        .enqueue_ref(NewTask::new("ns-1", TaskPayload::reindex("blobs")))
        .await
        .unwrap();
    let snapshot = engine.status().task(&task).await.unwrap().unwrap();

    let dispatchers: Vec<_> = (0..8).map(|_| engine.dispatcher()).collect();
    let mut claims = tokio::task::JoinSet::new();
    for dispatcher in dispatchers {
        let snapshot = snapshot.clone();
        claims.spawn(async move { dispatcher.claim(&snapshot).await.unwrap() });
    }
    let mut winners = 0;
    while let Some(won) = claims.join_next().await {
        if won.unwrap() {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
    let row = engine.status().task(&task).await.unwrap().unwrap();
    assert_eq!(row.state, TaskState::Running);
    assert_eq!(row.attempt, 1);
}

#[tokio::test]
async fn polls_skip_rows_reserved_by_another_dispatcher() {
    let (engine, _) = start(counting(Executions::default())).await;
    engine
        .producer()
        .enqueue(NewTask::new("ns-1", TaskPayload::reindex("blobs")))
        .await
        .unwrap();

    let first = engine.dispatcher();
    let second = engine.dispatcher();
    assert_eq!(first.poll(&PartitionScope::All, 10).await.unwrap().len(), 1);
    assert!(second.poll(&PartitionScope::All, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn poll_limit_caps_rows_across_partitions() {
    let (engine, _) = start(counting(Executions::default())).await;
    let producer = engine.producer();
    for n in 0..50 {
        producer
            .enqueue(NewTask::new(format!("ns-{n}"), TaskPayload::reindex(format!("idx-{n}"))))
            .await
            .unwrap();
    }
    assert!(engine.catalog().partitions().await.unwrap().len() > 1);

    let dispatcher = engine.dispatcher();
    assert_eq!(dispatcher.poll(&PartitionScope::All, 1).await.unwrap().len(), 1);

    // the rest comes out in bounded batches until every row is reserved
    let mut reserved = 1;
    loop {
        let batch = dispatcher.poll(&PartitionScope::All, 7).await.unwrap();
        assert!(batch.len() <= 7);
        if batch.is_empty() {
            break;
        }
        reserved += batch.len();
    }
    assert_eq!(reserved, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_task_runs_exactly_once_across_dispatchers() {
    let executions = Executions::default();
    let (engine, _) = start(counting(executions.clone())).await;
    let producer = engine.producer();
    let mut ids = Vec::new();
    for n in 0..200 {
        let task = NewTask::new(format!("ns-{n}"), TaskPayload::reindex(format!("idx-{n}")));
        ids.push(producer.enqueue(task).await.unwrap());
    }

    let dispatchers: Vec<_> = (0..4).map(|_| engine.dispatcher()).collect();
    for _ in 0..200 {
        let mut rounds = tokio::task::JoinSet::new();
        for dispatcher in &dispatchers {
            let dispatcher = dispatcher.clone();
            rounds.spawn(async move { dispatcher.run_once(&PartitionScope::All).await.unwrap() });
        }
        while rounds.join_next().await.is_some() {}
        if engine.status().totals().await.unwrap().is_drained() {
            break;
        }
    }

    let totals = engine.status().totals().await.unwrap();
    assert_eq!(totals.succeeded, 200);

    let executions = executions.lock().unwrap();
    assert_eq!(executions.len(), 200);
    for id in &ids {
        assert_eq!(executions.get(id), Some(&1), "task {id}");
    }
}
