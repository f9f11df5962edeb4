//! End-to-end delivery scenarios against a mock HTTP endpoint.
//!
//! Each test runs the real dispatcher, scheduler and worker over in-memory
//! storage and queue with a deterministic clock.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use hookwire_core::models::{AttemptStatus, Endpoint, ErrorCode, TriggerMode};
use hookwire_delivery::{hook::OutboundHook, DeliveryRequest};
use hookwire_testing::{EndpointBuilder, EventBuilder, TestEnv};
use serde_json::json;
use wiremock::{
    matchers::{body_json, header, method, path},
    Mock, ResponseTemplate,
};

async fn mount_status(env: &TestEnv, status: u16) {
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&env.http)
        .await;
}

#[tokio::test]
async fn retries_until_endpoint_recovers() -> Result<()> {
    let env = TestEnv::new().await?;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&env.http)
        .await;
    mount_status(&env, 200).await;

    let workspace_id = env.create_workspace().await;
    env.create_endpoint(env.endpoint(workspace_id, "/hook").retry(&[0, 10, 20]).build()).await;
    let attempts = env.dispatch(workspace_id, vec![EventBuilder::new().build()]).await?;
    let event_id = attempts[0].event_id;

    assert_eq!(env.run_delivery_cycle().await?, 1);
    env.advance_time(Duration::from_secs(10));
    assert_eq!(env.run_delivery_cycle().await?, 1);
    env.advance_time(Duration::from_secs(20));
    assert_eq!(env.run_delivery_cycle().await?, 1);

    let chain = env.attempts_for(event_id).await;
    let statuses: Vec<AttemptStatus> = chain.iter().map(|a| a.status).collect();
    assert_eq!(
        statuses,
        vec![AttemptStatus::Failed, AttemptStatus::Failed, AttemptStatus::Success]
    );
    assert!(chain.iter().all(|a| !a.exhausted));
    assert_eq!(chain[1].trigger_mode, TriggerMode::Automatic);
    assert_eq!(env.received_requests().await, 3);
    assert_eq!(env.events.failed().await, 2);
    assert_eq!(env.events.succeeded().await, 1);
    Ok(())
}

#[tokio::test]
async fn attempts_stop_at_schedule_length() -> Result<()> {
    let env = TestEnv::new().await?;
    mount_status(&env, 503).await;

    let workspace_id = env.create_workspace().await;
    env.create_endpoint(env.endpoint(workspace_id, "/hook").retry(&[0, 5]).build()).await;
    let attempts = env.dispatch(workspace_id, vec![EventBuilder::new().build()]).await?;

    for _ in 0..4 {
        env.run_delivery_cycle().await?;
        env.advance_time(Duration::from_secs(5));
    }

    let chain = env.attempts_for(attempts[0].event_id).await;
    assert_eq!(chain.len(), 2);
    assert!(!chain[0].exhausted);
    assert!(chain[1].exhausted);
    assert_eq!(chain[1].response.map(|r| r.status), Some(503));
    assert_eq!(env.received_requests().await, 2);
    assert!(env.queue.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn disabling_endpoint_cancels_pending_retry() -> Result<()> {
    let env = TestEnv::new().await?;
    mount_status(&env, 500).await;

    let workspace_id = env.create_workspace().await;
    let endpoint =
        env.create_endpoint(env.endpoint(workspace_id, "/hook").retry(&[0, 30]).build()).await;
    let attempts = env.dispatch(workspace_id, vec![EventBuilder::new().build()]).await?;
    env.run_delivery_cycle().await?;

    env.storage.set_endpoint_enabled(endpoint.id, false).await;
    env.advance_time(Duration::from_secs(30));
    env.run_delivery_cycle().await?;

    let chain = env.attempts_for(attempts[0].event_id).await;
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1].status, AttemptStatus::Canceled);
    assert_eq!(chain[1].error_code, Some(ErrorCode::EndpointDisabled));
    assert!(!chain[1].exhausted);
    assert_eq!(env.received_requests().await, 1);
    assert_eq!(env.events.canceled().await, 1);
    Ok(())
}

#[tokio::test]
async fn acl_denies_loopback_endpoint() -> Result<()> {
    let env = TestEnv::builder().acl_rules(&["@default"]).build().await?;
    mount_status(&env, 200).await;

    let workspace_id = env.create_workspace().await;
    env.create_endpoint(env.endpoint(workspace_id, "/hook").retry(&[0]).build()).await;
    let attempts = env.dispatch(workspace_id, vec![EventBuilder::new().build()]).await?;
    env.run_delivery_cycle().await?;

    let chain = env.attempts_for(attempts[0].event_id).await;
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].status, AttemptStatus::Failed);
    assert_eq!(chain[0].error_code, Some(ErrorCode::Denied));
    assert!(chain[0].exhausted);
    assert_eq!(env.received_requests().await, 0);
    Ok(())
}

#[tokio::test]
async fn acl_denies_hostname_resolving_to_loopback_on_every_retry() -> Result<()> {
    let env = TestEnv::builder().acl_rules(&["@default"]).build().await?;
    mount_status(&env, 200).await;

    let workspace_id = env.create_workspace().await;
    let url = format!("http://localhost:{}/hook", env.http.address().port());
    env.create_endpoint(EndpointBuilder::new(workspace_id, url).retry(&[0, 60]).build()).await;
    let attempts = env.dispatch(workspace_id, vec![EventBuilder::new().build()]).await?;

    assert_eq!(env.run_delivery_cycle().await?, 1);
    env.advance_time(Duration::from_secs(60));
    assert_eq!(env.run_delivery_cycle().await?, 1);

    let chain = env.attempts_for(attempts[0].event_id).await;
    assert_eq!(chain.len(), 2);
    for attempt in &chain {
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.error_code, Some(ErrorCode::Denied));
    }
    assert!(!chain[0].exhausted);
    assert!(chain[1].exhausted);
    assert_eq!(env.received_requests().await, 0);
    assert!(env.queue.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn payload_and_configured_headers_are_sent() -> Result<()> {
    let env = TestEnv::new().await?;
    Mock::given(method("PUT"))
        .and(path("/orders"))
        .and(header("x-api-key", "secret"))
        .and(header("content-type", "application/json; charset=utf-8"))
        .and(body_json(json!({"order_id": 77})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&env.http)
        .await;

    let workspace_id = env.create_workspace().await;
    env.create_endpoint(
        env.endpoint(workspace_id, "/orders")
            .method(hookwire_core::models::HttpMethod::Put)
            .header("x-api-key", "secret")
            .build(),
    )
    .await;

    let event = EventBuilder::new().data(json!({"order_id": 77})).build();
    env.dispatch(workspace_id, vec![event]).await?;
    env.run_delivery_cycle().await?;

    assert_eq!(env.count_with_status(AttemptStatus::Success).await, 1);
    Ok(())
}

#[tokio::test]
async fn duplicate_unique_ids_are_dispatched_once() -> Result<()> {
    let env = TestEnv::new().await?;
    mount_status(&env, 200).await;

    let workspace_id = env.create_workspace().await;
    env.create_endpoint(env.endpoint(workspace_id, "/hook").build()).await;

    let first = env
        .dispatch(workspace_id, vec![EventBuilder::new().unique_id("order-1").build()])
        .await?;
    let second = env
        .dispatch(
            workspace_id,
            vec![
                EventBuilder::new().unique_id("order-1").build(),
                EventBuilder::new().unique_id("order-2").build(),
                EventBuilder::new().unique_id("order-2").build(),
            ],
        )
        .await?;

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(env.storage.events().await.len(), 2);
    assert_eq!(env.engine().stats().await.events_persisted, 2);

    env.run_delivery_cycle().await?;
    assert_eq!(env.received_requests().await, 2);
    Ok(())
}

#[tokio::test]
async fn fanout_reaches_every_subscribed_endpoint() -> Result<()> {
    let env = TestEnv::new().await?;
    mount_status(&env, 200).await;

    let workspace_id = env.create_workspace().await;
    for _ in 0..3 {
        env.create_endpoint(env.endpoint(workspace_id, "/hook").build()).await;
    }
    env.create_endpoint(env.endpoint(workspace_id, "/hook").events(&["user.created"]).build())
        .await;
    env.create_endpoint(env.endpoint(workspace_id, "/hook").disabled().build()).await;

    let attempts = env.dispatch(workspace_id, vec![EventBuilder::new().build()]).await?;
    assert_eq!(attempts.len(), 3);

    env.run_delivery_cycle().await?;
    assert_eq!(env.received_requests().await, 3);
    Ok(())
}

#[tokio::test]
async fn manual_redelivery_targets_given_endpoint() -> Result<()> {
    let env = TestEnv::new().await?;
    mount_status(&env, 200).await;

    let workspace_id = env.create_workspace().await;
    let endpoint = env.create_endpoint(env.endpoint(workspace_id, "/hook").build()).await;
    let attempts = env.dispatch(workspace_id, vec![EventBuilder::new().build()]).await?;
    env.run_delivery_cycle().await?;

    let event = env
        .storage
        .events()
        .await
        .into_iter()
        .find(|e| e.id == attempts[0].event_id)
        .ok_or_else(|| anyhow::anyhow!("event not stored"))?;
    let manual = env.engine().dispatcher().dispatch_endpoint(&event, &[endpoint]).await?;
    env.run_delivery_cycle().await?;

    assert_eq!(manual.len(), 1);
    assert_eq!(manual[0].trigger_mode, TriggerMode::Manual);
    let stored = env.storage.attempt(manual[0].id).await;
    assert_eq!(stored.map(|a| a.status), Some(AttemptStatus::Success));
    assert_eq!(env.received_requests().await, 2);
    Ok(())
}

#[tokio::test]
async fn requeue_picks_up_retries_beyond_the_window() -> Result<()> {
    let env = TestEnv::builder().pre_schedule_window(Duration::from_secs(10)).build().await?;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&env.http)
        .await;
    mount_status(&env, 200).await;

    let workspace_id = env.create_workspace().await;
    env.create_endpoint(env.endpoint(workspace_id, "/hook").retry(&[0, 60]).build()).await;
    let attempts = env.dispatch(workspace_id, vec![EventBuilder::new().build()]).await?;
    env.run_delivery_cycle().await?;

    let chain = env.attempts_for(attempts[0].event_id).await;
    assert_eq!(chain[1].status, AttemptStatus::Init);
    assert!(!env.queue.contains(chain[1].id).await);

    env.advance_time(Duration::from_secs(61));
    assert_eq!(env.run_requeue().await?, 1);
    env.run_delivery_cycle().await?;

    let chain = env.attempts_for(attempts[0].event_id).await;
    assert_eq!(chain[1].status, AttemptStatus::Success);
    Ok(())
}

#[derive(Debug)]
struct SignatureHook;

#[async_trait]
impl OutboundHook for SignatureHook {
    async fn before_deliver(
        &self,
        request: &mut DeliveryRequest,
        endpoint: &Endpoint,
    ) -> hookwire_delivery::Result<()> {
        request.headers.insert("x-hookwire-endpoint".into(), endpoint.id.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn outbound_hook_rewrites_requests() -> Result<()> {
    let env = TestEnv::builder().hook(Arc::new(SignatureHook)).build().await?;
    let workspace_id = env.create_workspace().await;
    let endpoint = env.create_endpoint(env.endpoint(workspace_id, "/hook").build()).await;
    Mock::given(method("POST"))
        .and(header("x-hookwire-endpoint", endpoint.id.to_string().as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&env.http)
        .await;

    env.dispatch(workspace_id, vec![EventBuilder::new().build()]).await?;
    env.run_delivery_cycle().await?;

    assert_eq!(env.count_with_status(AttemptStatus::Success).await, 1);
    Ok(())
}
