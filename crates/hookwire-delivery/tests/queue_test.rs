//! Work queue claim semantics.
//!
//! The in-memory queue runs everywhere. The Redis tests need a server and
//! are ignored by default:
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1:6379 cargo test -p hookwire-delivery --test queue_test -- --ignored
//! ```

use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use hookwire_core::{
    models::{AttemptId, EndpointId, EventId},
    time::{Clock, TestClock},
};
use hookwire_delivery::{
    queue::{mock::InMemoryTaskQueue, QueueConfig, RedisTaskQueue},
    Task, TaskPayload, TaskQueue,
};
use serde_json::json;

fn task_at(scheduled_at: DateTime<Utc>) -> Task {
    Task {
        id: AttemptId::new(),
        scheduled_at,
        payload: TaskPayload {
            event_id: EventId::new(),
            endpoint_id: EndpointId::new(),
            attempt_number: 1,
            event: json!({"n": 1}),
        },
    }
}

/// Claims from `claimers` concurrent callers and returns every id handed out.
async fn claim_concurrently(
    queue: Arc<dyn TaskQueue>,
    claimers: usize,
    per_claim: usize,
) -> Result<Vec<AttemptId>> {
    let claims = (0..claimers).map(|_| {
        let queue = queue.clone();
        tokio::spawn(async move { queue.get(per_claim).await })
    });

    let mut ids = Vec::new();
    for joined in join_all(claims).await {
        ids.extend(joined??.into_iter().map(|task| task.id));
    }
    Ok(ids)
}

#[tokio::test]
async fn concurrent_claims_never_overlap() -> Result<()> {
    let clock = TestClock::new();
    let queue = InMemoryTaskQueue::new(Arc::new(clock.clone()), Duration::from_secs(65));
    let now = clock.now_utc();
    queue.add((0..50).map(|_| task_at(now)).collect()).await?;

    let ids = claim_concurrently(Arc::new(queue.clone()), 8, 10).await?;

    let unique: HashSet<AttemptId> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 50);
    assert_eq!(unique.len(), 50);
    assert!(queue.get(10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn undeleted_task_is_reclaimed_after_visibility_timeout() -> Result<()> {
    let clock = TestClock::new();
    let queue = InMemoryTaskQueue::new(Arc::new(clock.clone()), Duration::from_secs(65));
    let task = task_at(clock.now_utc());
    queue.add(vec![task.clone()]).await?;

    assert_eq!(queue.get(1).await?.len(), 1);
    clock.advance(Duration::from_secs(64));
    assert!(queue.get(1).await?.is_empty());
    clock.advance(Duration::from_secs(2));

    let reclaimed = queue.get(1).await?;
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, task.id);
    assert_eq!(reclaimed[0].payload, task.payload);

    queue.delete(vec![task.id]).await?;
    clock.advance(Duration::from_secs(120));
    assert!(queue.get(1).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn stats_report_depth_and_backlog() -> Result<()> {
    let clock = TestClock::new();
    let queue = InMemoryTaskQueue::new(Arc::new(clock.clone()), Duration::from_secs(65));
    let now = clock.now_utc();
    queue.add(vec![task_at(now), task_at(now + chrono::Duration::seconds(600))]).await?;
    clock.advance(Duration::from_secs(3));

    let stats = queue.stats().await?;
    assert_eq!(stats.depth, 2);
    assert_eq!(stats.backlog_latency, Duration::from_secs(3));
    Ok(())
}

async fn redis_queue(visibility_timeout: Duration) -> Result<RedisTaskQueue> {
    let url = std::env::var("REDIS_URL").context("REDIS_URL must be set for redis tests")?;
    let client = redis::Client::open(url)?;
    let conn = redis::aio::ConnectionManager::new(client).await?;
    let prefix = uuid::Uuid::new_v4().simple().to_string();
    Ok(RedisTaskQueue::new(conn, QueueConfig {
        queue_key: format!("hookwire:test:{prefix}:queue"),
        data_key: format!("hookwire:test:{prefix}:queue_data"),
        visibility_timeout,
    }))
}

#[tokio::test]
#[ignore = "requires REDIS_URL"]
async fn redis_concurrent_claims_never_overlap() -> Result<()> {
    let queue = redis_queue(Duration::from_secs(65)).await?;
    let due = Utc::now() - chrono::Duration::seconds(1);
    queue.add((0..40).map(|_| task_at(due)).collect()).await?;

    let ids = claim_concurrently(Arc::new(queue), 8, 10).await?;

    let unique: HashSet<AttemptId> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 40);
    assert_eq!(unique.len(), 40);
    Ok(())
}

#[tokio::test]
#[ignore = "requires REDIS_URL"]
async fn redis_reclaims_after_visibility_timeout() -> Result<()> {
    let queue = redis_queue(Duration::from_millis(300)).await?;
    let task = task_at(Utc::now() - chrono::Duration::seconds(1));
    queue.add(vec![task.clone()]).await?;

    assert_eq!(queue.get(1).await?.len(), 1);
    assert!(queue.get(1).await?.is_empty());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let reclaimed = queue.get(1).await?;
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, task.id);
    assert_eq!(reclaimed[0].payload, task.payload);

    queue.delete(vec![task.id]).await?;
    assert_eq!(queue.stats().await?.depth, 0);
    Ok(())
}

#[tokio::test]
#[ignore = "requires REDIS_URL"]
async fn redis_future_tasks_stay_hidden() -> Result<()> {
    let queue = redis_queue(Duration::from_secs(65)).await?;
    queue.add(vec![task_at(Utc::now() + chrono::Duration::seconds(600))]).await?;

    assert!(queue.get(10).await?.is_empty());
    let stats = queue.stats().await?;
    assert_eq!(stats.depth, 1);
    assert_eq!(stats.backlog_latency, Duration::ZERO);
    Ok(())
}
