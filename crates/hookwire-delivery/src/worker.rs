//! Delivery worker: claims tasks and drives each attempt to a terminal state.
//!
//! One task is one attempt. For each claimed task the worker loads the
//! endpoint, builds the outbound request, delivers it and writes the outcome
//! together with the successor attempt in one transaction. The successor is
//! then scheduled and the task deleted. Any error before the delete leaves
//! the task in the queue, where the visibility timeout hands it to another
//! claim.

use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{future::join_all, FutureExt};
use hookwire_core::{
    events::{
        AttemptCanceledEvent, AttemptEvent, AttemptFailedEvent, AttemptSucceededEvent,
        EventHandler,
    },
    models::{
        Attempt, AttemptDetail, AttemptKey, AttemptRequest, AttemptResponse, AttemptResult,
        AttemptStatus, Endpoint, ErrorCode,
    },
    time::Clock,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    client::{DeliveryClient, DeliveryRequest, DeliveryResponse},
    engine::{DeliveryConfig, EngineStats},
    error::{ErrorCategory, Result},
    hook::OutboundHook,
    queue::{Task, TaskQueue},
    scheduler::TaskScheduler,
    storage::{AttemptOutcome, DeliveryStorage},
};

/// Pause after a failed claim before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Everything a worker needs, shared by all workers of a pool.
#[derive(Clone)]
pub struct WorkerContext {
    /// Attempt and endpoint storage.
    pub storage: Arc<dyn DeliveryStorage>,
    /// Work queue tasks are claimed from.
    pub queue: Arc<dyn TaskQueue>,
    /// Schedules successor attempts.
    pub scheduler: TaskScheduler,
    /// ACL-gated HTTP client.
    pub client: Arc<DeliveryClient>,
    /// Request interception point.
    pub hook: Arc<dyn OutboundHook>,
    /// Receives attempt lifecycle events.
    pub event_handler: Arc<dyn EventHandler>,
    /// Shared counters.
    pub stats: Arc<RwLock<EngineStats>>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Engine configuration.
    pub config: DeliveryConfig,
}

/// What happened to a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Endpoint answered 2xx.
    Succeeded,
    /// Delivery failed; `exhausted` tells whether a successor was created.
    Failed {
        /// No successor follows.
        exhausted: bool,
    },
    /// Endpoint missing or disabled.
    Canceled,
    /// Attempt was already terminal; the task was a duplicate.
    Duplicate,
}

/// Individual worker that processes webhook deliveries.
pub struct DeliveryWorker {
    id: usize,
    ctx: WorkerContext,
    cancellation_token: CancellationToken,
}

impl DeliveryWorker {
    /// Creates a new delivery worker.
    pub fn new(id: usize, ctx: WorkerContext, cancellation_token: CancellationToken) -> Self {
        Self { id, ctx, cancellation_token }
    }

    /// Main worker loop: claims and processes tasks until cancelled.
    ///
    /// Polls again immediately while claims return tasks and sleeps
    /// `poll_interval` once the queue has nothing due.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.ctx.clock.sleep(self.ctx.config.poll_interval) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        error = %error,
                        "worker batch processing failed"
                    );
                    tokio::select! {
                        () = self.ctx.clock.sleep(ERROR_BACKOFF) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Claims up to `batch_size` tasks and processes them concurrently.
    ///
    /// Returns the number of tasks claimed. Per-task errors and panics are
    /// logged and leave the task for reclaim.
    ///
    /// # Errors
    ///
    /// Returns the queue error when the claim itself fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let tasks = self
            .ctx
            .queue
            .get(self.ctx.config.batch_size)
            .instrument(info_span!("claim", worker_id = self.id))
            .await?;
        let claimed = tasks.len();
        if claimed == 0 {
            return Ok(0);
        }

        debug!(worker_id = self.id, claimed, "processing task batch");

        let runs = tasks.into_iter().map(|task| {
            let attempt_id = task.id;
            let run = AssertUnwindSafe(self.process_task(task)).catch_unwind();
            async move { (attempt_id, run.await) }
        });

        for (attempt_id, result) in join_all(runs).await {
            match result {
                Ok(Ok(outcome)) => {
                    debug!(worker_id = self.id, %attempt_id, ?outcome, "task processed");
                },
                Ok(Err(error)) => {
                    warn!(
                        worker_id = self.id,
                        %attempt_id,
                        category = %ErrorCategory::from(&error),
                        error = %error,
                        "task processing failed, leaving it for reclaim"
                    );
                },
                Err(panic) => {
                    error!(
                        worker_id = self.id,
                        %attempt_id,
                        panic = %panic_message(panic.as_ref()),
                        "task processing panicked, leaving it for reclaim"
                    );
                },
            }
        }

        Ok(claimed)
    }

    /// Drives one claimed task to a terminal attempt state.
    ///
    /// # Errors
    ///
    /// Storage, queue and hook errors are returned; the task then stays in
    /// the queue.
    pub async fn process_task(&self, task: Task) -> Result<TaskOutcome> {
        let endpoint = match self.ctx.storage.find_endpoint(task.payload.endpoint_id).await? {
            Some(endpoint) if endpoint.enabled => endpoint,
            _ => return self.cancel(&task).await,
        };

        let mut request = self.build_request(&task, &endpoint)?;
        self.ctx.hook.before_deliver(&mut request, &endpoint).await?;

        let snapshot = AttemptRequest { method: request.method, url: request.url.clone() };
        let sent_headers = self.ctx.client.outbound_headers(&request.headers);
        let sent_body = String::from_utf8_lossy(&request.body).into_owned();

        let attempted_at = self.ctx.clock.now_utc();
        {
            let mut stats = self.ctx.stats.write().await;
            stats.in_flight_deliveries += 1;
        }
        let delivered = self.ctx.client.deliver(request).await;
        {
            let mut stats = self.ctx.stats.write().await;
            stats.in_flight_deliveries = stats.in_flight_deliveries.saturating_sub(1);
        }

        let delivered = match delivered {
            Ok(mut response) => {
                self.ctx.hook.after_deliver(&mut response).await;
                Ok(response)
            },
            Err(error) if error.is_delivery_failure() => Err(error),
            Err(error) => return Err(error),
        };

        let key = AttemptKey {
            event_id: task.payload.event_id,
            endpoint_id: endpoint.id,
            workspace_id: endpoint.workspace_id,
        };
        let attempt_number = task.payload.attempt_number;
        let now = self.ctx.clock.now_utc();

        let (result, error_message) = match &delivered {
            Ok(response) if response.is_success => (
                AttemptResult {
                    status: AttemptStatus::Success,
                    attempted_at,
                    exhausted: false,
                    error_code: None,
                    request: snapshot,
                    response: Some(response_snapshot(response)),
                },
                None,
            ),
            Ok(response) => (
                AttemptResult {
                    status: AttemptStatus::Failed,
                    attempted_at,
                    exhausted: endpoint.retry.is_exhausted(attempt_number),
                    error_code: None,
                    request: snapshot,
                    response: Some(response_snapshot(response)),
                },
                Some(format!("endpoint answered HTTP {}", response.status_code)),
            ),
            Err(error) => (
                AttemptResult {
                    status: AttemptStatus::Failed,
                    attempted_at,
                    exhausted: endpoint.retry.is_exhausted(attempt_number),
                    error_code: error.error_code(),
                    request: snapshot,
                    response: None,
                },
                Some(error.to_string()),
            ),
        };

        let next = if result.status == AttemptStatus::Failed {
            Attempt::retry_of(key, attempt_number, attempted_at, &endpoint.retry, now)
        } else {
            None
        };

        let detail = AttemptDetail {
            id: task.id,
            workspace_id: endpoint.workspace_id,
            request_headers: sent_headers,
            request_body: Some(sent_body),
            response_headers: delivered.as_ref().ok().map(|r| r.headers.clone()),
            response_body: delivered.as_ref().ok().map(|r| r.body.clone()),
            created_at: now,
        };

        let outcome = AttemptOutcome {
            attempt_id: task.id,
            result: result.clone(),
            detail,
            next: next.clone(),
        };
        if !self.ctx.storage.record_outcome(outcome).await? {
            debug!(
                worker_id = self.id,
                attempt_id = %task.id,
                "attempt already finished, dropping duplicate task"
            );
            self.ctx.queue.delete(vec![task.id]).await?;
            self.ctx.stats.write().await.duplicate_tasks += 1;
            return Ok(TaskOutcome::Duplicate);
        }

        if let Some(next) = &next {
            let events = HashMap::from([(next.event_id, task.payload.event.clone())]);
            let scheduled = self.ctx.scheduler.schedule(std::slice::from_ref(next), &events).await;
            if let Err(error) = scheduled {
                warn!(
                    worker_id = self.id,
                    attempt_id = %next.id,
                    error = %error,
                    "failed to schedule retry, requeue sweep will pick it up"
                );
            }
        }

        if let Err(error) = self.ctx.queue.delete(vec![task.id]).await {
            warn!(
                worker_id = self.id,
                attempt_id = %task.id,
                error = %error,
                "failed to delete finished task, it will be dropped on reclaim"
            );
        }

        self.publish(&task, &endpoint, &result, error_message, now).await;

        Ok(match result.status {
            AttemptStatus::Success => TaskOutcome::Succeeded,
            _ => TaskOutcome::Failed { exhausted: result.exhausted },
        })
    }

    fn build_request(&self, task: &Task, endpoint: &Endpoint) -> Result<DeliveryRequest> {
        let body = serde_json::to_vec(&task.payload.event)?;
        Ok(DeliveryRequest {
            attempt_id: task.id,
            event_id: task.payload.event_id,
            url: endpoint.request.url.clone(),
            method: endpoint.request.method,
            headers: endpoint.request.headers.clone(),
            body: Bytes::from(body),
            timeout: endpoint.request.timeout(),
            attempt_number: task.payload.attempt_number,
        })
    }

    async fn cancel(&self, task: &Task) -> Result<TaskOutcome> {
        let canceled =
            self.ctx.storage.cancel_attempt(task.id, ErrorCode::EndpointDisabled).await?;
        self.ctx.queue.delete(vec![task.id]).await?;

        if !canceled {
            return Ok(TaskOutcome::Duplicate);
        }

        info!(
            worker_id = self.id,
            attempt_id = %task.id,
            endpoint_id = %task.payload.endpoint_id,
            "endpoint missing or disabled, attempt canceled"
        );
        {
            let mut stats = self.ctx.stats.write().await;
            stats.attempts_total += 1;
            stats.attempts_canceled += 1;
        }
        self.ctx
            .event_handler
            .handle_event(AttemptEvent::Canceled(AttemptCanceledEvent {
                attempt_id: task.id,
                event_id: task.payload.event_id,
                endpoint_id: task.payload.endpoint_id,
                error_code: ErrorCode::EndpointDisabled,
                canceled_at: self.ctx.clock.now_utc(),
            }))
            .await;

        Ok(TaskOutcome::Canceled)
    }

    async fn publish(
        &self,
        task: &Task,
        endpoint: &Endpoint,
        result: &AttemptResult,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) {
        let event = match error_message {
            None => {
                info!(
                    worker_id = self.id,
                    attempt_id = %task.id,
                    event_id = %task.payload.event_id,
                    endpoint_id = %endpoint.id,
                    workspace_id = %endpoint.workspace_id,
                    "webhook delivered successfully"
                );
                let mut stats = self.ctx.stats.write().await;
                stats.attempts_total += 1;
                stats.attempts_succeeded += 1;
                drop(stats);

                AttemptEvent::Succeeded(AttemptSucceededEvent {
                    attempt_id: task.id,
                    event_id: task.payload.event_id,
                    endpoint_id: endpoint.id,
                    workspace_id: endpoint.workspace_id,
                    endpoint_url: endpoint.request.url.clone(),
                    response_status: result.response.map_or(0, |r| r.status),
                    attempt_number: task.payload.attempt_number,
                    latency_ms: result.response.map_or(0, |r| r.latency_ms),
                    delivered_at: now,
                })
            },
            Some(message) => {
                warn!(
                    worker_id = self.id,
                    attempt_id = %task.id,
                    event_id = %task.payload.event_id,
                    endpoint_id = %endpoint.id,
                    attempt = task.payload.attempt_number,
                    exhausted = result.exhausted,
                    error = %message,
                    "webhook delivery failed"
                );
                let mut stats = self.ctx.stats.write().await;
                stats.attempts_total += 1;
                stats.attempts_failed += 1;
                if result.exhausted {
                    stats.attempts_exhausted += 1;
                }
                drop(stats);

                AttemptEvent::Failed(AttemptFailedEvent {
                    attempt_id: task.id,
                    event_id: task.payload.event_id,
                    endpoint_id: endpoint.id,
                    workspace_id: endpoint.workspace_id,
                    endpoint_url: endpoint.request.url.clone(),
                    response_status: result.response.map(|r| r.status),
                    error_code: result.error_code,
                    attempt_number: task.payload.attempt_number,
                    exhausted: result.exhausted,
                    failed_at: now,
                    error_message: message,
                })
            },
        };

        self.ctx.event_handler.handle_event(event).await;
    }
}

fn response_snapshot(response: &DeliveryResponse) -> AttemptResponse {
    AttemptResponse {
        status: response.status_code,
        latency_ms: u64::try_from(response.duration.as_millis()).unwrap_or(u64::MAX),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl std::fmt::Debug for DeliveryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryWorker").field("id", &self.id).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use hookwire_core::{
        models::{Event, RetryConfig, TriggerMode, WorkspaceId},
        time::TestClock,
    };
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{
        acl::Acl,
        client::ClientConfig,
        error::DeliveryError,
        hook::NoOpOutboundHook,
        queue::mock::InMemoryTaskQueue,
        storage::mock::MockDeliveryStorage,
    };

    #[derive(Debug, Default)]
    struct RecordingHandler {
        events: Mutex<Vec<AttemptEvent>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle_event(&self, event: AttemptEvent) {
            if let Ok(mut events) = self.events.lock() {
                events.push(event);
            }
        }
    }

    #[derive(Debug)]
    struct RejectingHook;

    #[async_trait]
    impl OutboundHook for RejectingHook {
        async fn before_deliver(
            &self,
            _request: &mut DeliveryRequest,
            _endpoint: &Endpoint,
        ) -> Result<()> {
            Err(DeliveryError::hook("signing key unavailable"))
        }
    }

    struct Fixture {
        storage: MockDeliveryStorage,
        queue: InMemoryTaskQueue,
        clock: TestClock,
        handler: Arc<RecordingHandler>,
        worker: DeliveryWorker,
    }

    fn fixture_with(acl: Acl, hook: Arc<dyn OutboundHook>) -> Fixture {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let queue = InMemoryTaskQueue::new(Arc::new(clock.clone()), Duration::from_secs(65));
        let scheduler = TaskScheduler::new(
            Arc::new(storage.clone()),
            Arc::new(queue.clone()),
            Arc::new(clock.clone()),
            Duration::from_secs(180),
        );
        let handler = Arc::new(RecordingHandler::default());
        let ctx = WorkerContext {
            storage: Arc::new(storage.clone()),
            queue: Arc::new(queue.clone()),
            scheduler,
            client: Arc::new(DeliveryClient::new(ClientConfig::default(), Arc::new(acl)).unwrap()),
            hook,
            event_handler: handler.clone(),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            clock: Arc::new(clock.clone()),
            config: DeliveryConfig::default(),
        };
        let worker = DeliveryWorker::new(0, ctx, CancellationToken::new());
        Fixture { storage, queue, clock, handler, worker }
    }

    fn fixture() -> Fixture {
        fixture_with(Acl::allow_all(), Arc::new(NoOpOutboundHook))
    }

    /// Persists an event with one attempt for `endpoint` and queues it.
    async fn queued_attempt(f: &Fixture, endpoint: &Endpoint) -> Attempt {
        f.storage.add_endpoint(endpoint.clone()).await;
        let mut event = Event::new("order.created", json!({"order": 42}));
        event.workspace_id = endpoint.workspace_id;
        let attempt = Attempt::first(&event, endpoint, TriggerMode::Initial, f.clock.now_utc());
        f.storage
            .insert_events_with_attempts(vec![event.clone()], vec![attempt.clone()])
            .await
            .unwrap();
        f.worker.ctx.scheduler.schedule_from_store(&[attempt.clone()]).await.unwrap();
        attempt
    }

    fn endpoint_for(server: &MockServer, attempts: Vec<u64>) -> Endpoint {
        let mut endpoint = Endpoint::new(WorkspaceId::new(), format!("{}/hook", server.uri()));
        endpoint.retry = RetryConfig::fixed(attempts);
        endpoint.request.headers.insert("x-team".into(), "acme".into());
        endpoint
    }

    fn recorded(f: &Fixture) -> Vec<AttemptEvent> {
        f.handler.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    #[tokio::test]
    async fn success_records_outcome_and_deletes_task() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-team", "acme"))
            .and(body_json(json!({"order": 42})))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture();
        let endpoint = endpoint_for(&server, vec![0, 60]);
        let attempt = queued_attempt(&f, &endpoint).await;

        assert_eq!(f.worker.process_batch().await.unwrap(), 1);

        let stored = f.storage.attempt(attempt.id).await.unwrap();
        assert_eq!(stored.status, AttemptStatus::Success);
        assert_eq!(stored.response.map(|r| r.status), Some(200));
        assert!(stored.attempted_at.is_some());
        assert!(!f.queue.contains(attempt.id).await);

        let detail = f.storage.detail(attempt.id).await.unwrap();
        assert_eq!(detail.response_body.as_deref(), Some("ok"));
        assert_eq!(detail.request_headers.get("x-team").map(String::as_str), Some("acme"));

        assert_eq!(f.storage.attempts().await.len(), 1);
        assert!(matches!(recorded(&f).as_slice(), [AttemptEvent::Succeeded(_)]));
        assert_eq!(f.worker.ctx.stats.read().await.attempts_succeeded, 1);
    }

    #[tokio::test]
    async fn failure_creates_successor_from_attempted_at() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let f = fixture();
        let endpoint = endpoint_for(&server, vec![0, 60, 300]);
        let attempt = queued_attempt(&f, &endpoint).await;

        f.worker.process_batch().await.unwrap();

        let stored = f.storage.attempt(attempt.id).await.unwrap();
        assert_eq!(stored.status, AttemptStatus::Failed);
        assert!(!stored.exhausted);
        assert_eq!(stored.error_code, None);

        let successor = f
            .storage
            .attempts()
            .await
            .into_iter()
            .find(|a| a.attempt_number == 2)
            .unwrap();
        assert_eq!(successor.trigger_mode, TriggerMode::Automatic);
        assert_eq!(successor.status, AttemptStatus::Queued);
        assert_eq!(
            successor.scheduled_at,
            stored.attempted_at.unwrap() + chrono::Duration::seconds(60)
        );
        assert!(f.queue.contains(successor.id).await);
        assert!(!f.queue.contains(attempt.id).await);
    }

    #[tokio::test]
    async fn last_attempt_is_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let f = fixture();
        let endpoint = endpoint_for(&server, vec![0]);
        let attempt = queued_attempt(&f, &endpoint).await;

        f.worker.process_batch().await.unwrap();

        let stored = f.storage.attempt(attempt.id).await.unwrap();
        assert!(stored.exhausted);
        assert_eq!(f.storage.attempts().await.len(), 1);
        match recorded(&f).as_slice() {
            [AttemptEvent::Failed(failed)] => {
                assert!(failed.exhausted);
                assert_eq!(failed.response_status, Some(500));
            },
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabled_endpoint_cancels_without_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let f = fixture();
        let endpoint = endpoint_for(&server, vec![0, 60, 3600]);
        let attempt = queued_attempt(&f, &endpoint).await;
        f.storage.set_endpoint_enabled(endpoint.id, false).await;

        f.worker.process_batch().await.unwrap();

        let stored = f.storage.attempt(attempt.id).await.unwrap();
        assert_eq!(stored.status, AttemptStatus::Canceled);
        assert_eq!(stored.error_code, Some(ErrorCode::EndpointDisabled));
        assert_eq!(stored.attempt_number, 1);
        assert!(!stored.exhausted, "cancellation does not consume retry slots");
        assert_eq!(f.storage.attempts().await.len(), 1);
        assert!(f.queue.is_empty().await);
        assert!(matches!(recorded(&f).as_slice(), [AttemptEvent::Canceled(_)]));
    }

    #[tokio::test]
    async fn missing_endpoint_cancels() {
        let server = MockServer::start().await;
        let f = fixture();
        let endpoint = endpoint_for(&server, vec![0]);
        let attempt = queued_attempt(&f, &endpoint).await;
        f.storage.remove_endpoint(endpoint.id).await;

        f.worker.process_batch().await.unwrap();

        let stored = f.storage.attempt(attempt.id).await.unwrap();
        assert_eq!(stored.status, AttemptStatus::Canceled);
        assert_eq!(stored.error_code, Some(ErrorCode::EndpointDisabled));
    }

    #[tokio::test]
    async fn acl_denial_fails_without_contacting_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let f = fixture_with(Acl::new(&["@default"]), Arc::new(NoOpOutboundHook));
        let endpoint = endpoint_for(&server, vec![0, 60]);
        let attempt = queued_attempt(&f, &endpoint).await;

        f.worker.process_batch().await.unwrap();

        let stored = f.storage.attempt(attempt.id).await.unwrap();
        assert_eq!(stored.status, AttemptStatus::Failed);
        assert_eq!(stored.error_code, Some(ErrorCode::Denied));
        assert!(stored.response.is_none());
        assert!(f.storage.detail(attempt.id).await.unwrap().response_body.is_none());
    }

    #[tokio::test]
    async fn hook_rejection_leaves_task_for_reclaim() {
        let server = MockServer::start().await;
        let f = fixture_with(Acl::allow_all(), Arc::new(RejectingHook));
        let endpoint = endpoint_for(&server, vec![0]);
        let attempt = queued_attempt(&f, &endpoint).await;

        assert_eq!(f.worker.process_batch().await.unwrap(), 1);

        assert_eq!(f.storage.attempt(attempt.id).await.unwrap().status, AttemptStatus::Queued);
        assert!(f.queue.contains(attempt.id).await);
        assert!(recorded(&f).is_empty());
    }

    #[tokio::test]
    async fn duplicate_task_is_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let f = fixture();
        let endpoint = endpoint_for(&server, vec![0]);
        let attempt = queued_attempt(&f, &endpoint).await;
        let task = f.queue.get(1).await.unwrap().remove(0);

        assert_eq!(f.worker.process_task(task.clone()).await.unwrap(), TaskOutcome::Succeeded);
        assert_eq!(f.worker.process_task(task).await.unwrap(), TaskOutcome::Duplicate);

        assert_eq!(f.storage.attempt(attempt.id).await.unwrap().status, AttemptStatus::Success);
        assert_eq!(recorded(&f).len(), 1);
        assert_eq!(f.worker.ctx.stats.read().await.duplicate_tasks, 1);
    }

    #[tokio::test]
    async fn storage_failure_leaves_task_for_reclaim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let f = fixture();
        let endpoint = endpoint_for(&server, vec![0]);
        let attempt = queued_attempt(&f, &endpoint).await;
        f.storage.fail_next_transaction("deadlock detected").await;

        f.worker.process_batch().await.unwrap();

        assert_eq!(f.storage.attempt(attempt.id).await.unwrap().status, AttemptStatus::Queued);
        assert!(f.queue.contains(attempt.id).await);

        f.clock.advance(Duration::from_secs(66));
        f.worker.process_batch().await.unwrap();
        assert_eq!(f.storage.attempt(attempt.id).await.unwrap().status, AttemptStatus::Success);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn worker_loop_can_be_spawned() {
        let f = fixture();
        let token = f.worker.cancellation_token.clone();
        let worker = DeliveryWorker::new(1, f.worker.ctx.clone(), token.clone());

        let run = async move { worker.run().await };
        assert_send(&run);
        let handle = tokio::spawn(run);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap().unwrap();
    }

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
