//! In-memory test environment running the real engine.
//!
//! Storage and queue are the in-process doubles from `hookwire-delivery`,
//! time is a `TestClock`, and endpoints point at a `wiremock` server. The
//! engine's workers are not spawned; tests drive delivery explicitly with
//! `run_delivery_cycle` and move time with `advance_time`.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookwire_core::{
    models::{Attempt, AttemptStatus, Endpoint, Event, EventId, WorkspaceId},
    time::{Clock, TestClock},
};
use hookwire_delivery::{
    hook::{NoOpOutboundHook, OutboundHook},
    queue::mock::InMemoryTaskQueue,
    storage::mock::MockDeliveryStorage,
    DeliveryConfig, DeliveryEngine,
};
use wiremock::MockServer;

use crate::{fixtures::EndpointBuilder, recorder::RecordingEventHandler};

/// Upper bound on claim rounds per delivery cycle.
const MAX_CYCLE_ROUNDS: usize = 1_000;

/// Builder for configuring a `TestEnv`.
#[derive(Debug)]
pub struct TestEnvBuilder {
    config: DeliveryConfig,
    visibility_timeout: Duration,
    hook: Arc<dyn OutboundHook>,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            config: DeliveryConfig { worker_count: 1, ..DeliveryConfig::default() },
            visibility_timeout: Duration::from_secs(65),
            hook: Arc::new(NoOpOutboundHook),
        }
    }
}

impl TestEnvBuilder {
    /// Creates a builder with an empty ACL and default timings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the egress deny rules.
    #[must_use]
    pub fn acl_rules(mut self, rules: &[&str]) -> Self {
        self.config.acl_rules = rules.iter().map(|r| (*r).to_string()).collect();
        self
    }

    /// Sets the claim batch size.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Sets the queue visibility timeout.
    #[must_use]
    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Sets the pre-schedule window.
    #[must_use]
    pub fn pre_schedule_window(mut self, window: Duration) -> Self {
        self.config.pre_schedule_window = window;
        self
    }

    /// Installs an outbound hook.
    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn OutboundHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Starts the mock server and builds the engine.
    ///
    /// # Errors
    ///
    /// Fails if the engine cannot be constructed.
    pub async fn build(self) -> Result<TestEnv> {
        let http = MockServer::start().await;
        let clock = TestClock::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let storage = MockDeliveryStorage::new();
        let queue = InMemoryTaskQueue::new(shared_clock.clone(), self.visibility_timeout);
        let events = Arc::new(RecordingEventHandler::new());

        let engine = DeliveryEngine::new(
            Arc::new(storage.clone()),
            Arc::new(queue.clone()),
            shared_clock,
            events.clone(),
            self.hook,
            self.config,
        )
        .context("failed to build delivery engine")?;

        Ok(TestEnv { http, clock, storage, queue, events, engine })
    }
}

/// Test environment with an engine over in-memory storage and queue.
pub struct TestEnv {
    /// Mock HTTP server endpoints point at.
    pub http: MockServer,
    /// Deterministic clock shared by every component.
    pub clock: TestClock,
    /// Store inspected and mutated by tests.
    pub storage: MockDeliveryStorage,
    /// Queue inspected by tests.
    pub queue: InMemoryTaskQueue,
    /// Attempt events published by workers.
    pub events: Arc<RecordingEventHandler>,
    engine: DeliveryEngine,
}

impl TestEnv {
    /// Environment with default settings.
    ///
    /// # Errors
    ///
    /// Fails if the engine cannot be constructed.
    pub async fn new() -> Result<Self> {
        TestEnvBuilder::new().build().await
    }

    /// Builder for non-default settings.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Engine under test.
    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// URL of `path` on the mock server.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.http.uri(), path)
    }

    /// Registers a new workspace.
    pub async fn create_workspace(&self) -> WorkspaceId {
        let workspace_id = WorkspaceId::new();
        self.storage.add_workspace(workspace_id).await;
        workspace_id
    }

    /// Builder for an endpoint on the mock server at `path`.
    pub fn endpoint(&self, workspace_id: WorkspaceId, path: &str) -> EndpointBuilder {
        EndpointBuilder::new(workspace_id, self.url(path))
    }

    /// Stores an endpoint and returns it.
    pub async fn create_endpoint(&self, endpoint: Endpoint) -> Endpoint {
        self.storage.add_endpoint(endpoint.clone()).await;
        endpoint
    }

    /// Dispatches events through the engine's dispatcher.
    ///
    /// # Errors
    ///
    /// Propagates dispatch failures.
    pub async fn dispatch(
        &self,
        workspace_id: WorkspaceId,
        events: Vec<Event>,
    ) -> Result<Vec<Attempt>> {
        Ok(self.engine.dispatcher().dispatch(workspace_id, events).await?)
    }

    /// Claims and processes batches until nothing is due.
    ///
    /// Returns the number of tasks claimed.
    ///
    /// # Errors
    ///
    /// Propagates claim failures.
    pub async fn run_delivery_cycle(&self) -> Result<usize> {
        let mut total = 0;
        for _ in 0..MAX_CYCLE_ROUNDS {
            let claimed = self.engine.process_batch().await?;
            if claimed == 0 {
                break;
            }
            total += claimed;
        }
        Ok(total)
    }

    /// Runs one requeue sweep.
    ///
    /// # Errors
    ///
    /// Propagates storage and queue failures.
    pub async fn run_requeue(&self) -> Result<usize> {
        Ok(self.engine.requeue_once().await?)
    }

    /// Moves every component's clock forward.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Attempts of `event_id`, ordered by attempt number.
    pub async fn attempts_for(&self, event_id: EventId) -> Vec<Attempt> {
        let mut attempts: Vec<Attempt> = self
            .storage
            .attempts()
            .await
            .into_iter()
            .filter(|a| a.event_id == event_id)
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        attempts
    }

    /// Number of stored attempts in `status`.
    pub async fn count_with_status(&self, status: AttemptStatus) -> usize {
        self.storage.attempts_with_status(status).await.len()
    }

    /// Requests received by the mock server.
    pub async fn received_requests(&self) -> usize {
        self.http.received_requests().await.map_or(0, |requests| requests.len())
    }
}
