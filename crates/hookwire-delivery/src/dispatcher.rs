//! Event intake: fanout, deduplication and transactional persistence.
//!
//! The dispatcher turns a batch of events into attempt rows. Events and
//! their attempts are committed together; tasks are only queued after the
//! commit, so a queue entry never exists without its row. If queueing fails
//! the rows stay `INIT` and the requeue sweep picks them up.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use hookwire_core::{
    models::{Attempt, Endpoint, Event, EventId, TriggerMode, WorkspaceId},
    time::Clock,
};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::Result, registry::Registry, scheduler::TaskScheduler, storage::DeliveryStorage,
};

/// Entry point for new events.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Registry,
    storage: Arc<dyn DeliveryStorage>,
    scheduler: TaskScheduler,
    clock: Arc<dyn Clock>,
    events_persisted: Arc<AtomicU64>,
}

/// One attempt per endpoint, due after the endpoint's first retry offset.
fn fanout(
    event: &Event,
    endpoints: &[Endpoint],
    trigger_mode: TriggerMode,
    clock: &dyn Clock,
) -> Vec<Attempt> {
    let now = clock.now_utc();
    endpoints.iter().map(|endpoint| Attempt::first(event, endpoint, trigger_mode, now)).collect()
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        registry: Registry,
        storage: Arc<dyn DeliveryStorage>,
        scheduler: TaskScheduler,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { registry, storage, scheduler, clock, events_persisted: Arc::new(AtomicU64::new(0)) }
    }

    /// Registry used for endpoint lookup.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Events persisted since startup.
    pub fn events_persisted(&self) -> u64 {
        self.events_persisted.load(Ordering::Relaxed)
    }

    /// Persists a batch of events for `workspace_id` and returns the attempts
    /// created for them.
    ///
    /// Events whose `unique_id` already exists in the workspace, or repeats
    /// an earlier event of the same batch, are dropped with their attempts.
    /// Events nobody subscribes to are still stored.
    ///
    /// # Errors
    ///
    /// Returns registry load failures and storage failures. Nothing from the
    /// batch is persisted when the transaction fails. Queueing failures are
    /// logged, not returned.
    pub async fn dispatch(
        &self,
        workspace_id: WorkspaceId,
        events: Vec<Event>,
    ) -> Result<Vec<Attempt>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let span = info_span!("dispatch", %workspace_id, events = events.len());
        self.dispatch_batch(workspace_id, events).instrument(span).await
    }

    async fn dispatch_batch(
        &self,
        workspace_id: WorkspaceId,
        mut events: Vec<Event>,
    ) -> Result<Vec<Attempt>> {
        for event in &mut events {
            event.workspace_id = workspace_id;
        }

        let mut attempts = Vec::new();
        for event in &events {
            let endpoints = self.registry.lookup(workspace_id, &event.event_type).await?;
            attempts.extend(fanout(event, &endpoints, TriggerMode::Initial, self.clock.as_ref()));
        }

        let events = self.deduplicate(workspace_id, events).await?;
        let kept: HashSet<EventId> = events.iter().map(|e| e.id).collect();
        attempts.retain(|a| kept.contains(&a.event_id));

        if attempts.is_empty() {
            let inserted = self.storage.insert_events(events).await?;
            self.record_persisted(inserted.len());
            debug!(persisted = inserted.len(), "stored events without subscribers");
            return Ok(Vec::new());
        }

        let payloads: HashMap<EventId, serde_json::Value> =
            events.iter().map(|e| (e.id, e.data.clone())).collect();
        let (inserted, persisted) =
            self.storage.insert_events_with_attempts(events, attempts).await?;
        self.record_persisted(inserted.len());
        debug!(events = inserted.len(), attempts = persisted.len(), "dispatched events");

        self.schedule(&persisted, &payloads).await;
        Ok(persisted)
    }

    /// Drops events whose unique id is taken or repeated within the batch.
    async fn deduplicate(
        &self,
        workspace_id: WorkspaceId,
        events: Vec<Event>,
    ) -> Result<Vec<Event>> {
        let unique_ids: Vec<String> = events.iter().filter_map(|e| e.unique_id.clone()).collect();
        if unique_ids.is_empty() {
            return Ok(events);
        }

        let mut seen: HashSet<String> = self
            .storage
            .find_existing_unique_ids(workspace_id, unique_ids)
            .await?
            .into_iter()
            .collect();

        let before = events.len();
        let events: Vec<Event> = events
            .into_iter()
            .filter(|event| match &event.unique_id {
                Some(unique_id) => seen.insert(unique_id.clone()),
                None => true,
            })
            .collect();

        if events.len() < before {
            debug!(dropped = before - events.len(), "dropped duplicate events");
        }
        Ok(events)
    }

    /// Creates manual attempts of an existing event for explicit endpoints.
    ///
    /// Bypasses the registry, so disabled endpoints get attempts too; the
    /// worker cancels those when they come due.
    ///
    /// # Errors
    ///
    /// Returns storage failures. Queueing failures are logged, not returned.
    pub async fn dispatch_endpoint(
        &self,
        event: &Event,
        endpoints: &[Endpoint],
    ) -> Result<Vec<Attempt>> {
        let attempts = fanout(event, endpoints, TriggerMode::Manual, self.clock.as_ref());
        if attempts.is_empty() {
            return Ok(attempts);
        }

        let span =
            info_span!("dispatch_endpoint", event_id = %event.id, endpoints = endpoints.len());
        async {
            self.storage.insert_attempts(attempts.clone()).await?;
            let payloads = HashMap::from([(event.id, event.data.clone())]);
            self.schedule(&attempts, &payloads).await;
            Ok::<_, crate::error::DeliveryError>(attempts)
        }
        .instrument(span)
        .await
    }

    async fn schedule(&self, attempts: &[Attempt], payloads: &HashMap<EventId, serde_json::Value>) {
        if let Err(e) = self.scheduler.schedule(attempts, payloads).await {
            warn!(
                attempts = attempts.len(),
                error = %e,
                "failed to queue attempts, leaving them for requeue"
            );
        }
    }

    fn record_persisted(&self, count: usize) {
        self.events_persisted.fetch_add(count as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hookwire_core::{
        models::{AttemptStatus, RetryConfig},
        time::TestClock,
    };
    use serde_json::json;

    use super::*;
    use crate::{
        queue::mock::InMemoryTaskQueue,
        registry::RegistryConfig,
        storage::mock::MockDeliveryStorage,
    };

    struct Fixture {
        storage: MockDeliveryStorage,
        queue: InMemoryTaskQueue,
        clock: TestClock,
        dispatcher: Dispatcher,
        workspace_id: WorkspaceId,
    }

    fn fixture() -> Fixture {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let queue = InMemoryTaskQueue::new(Arc::new(clock.clone()), Duration::from_secs(65));
        let storage_dyn: Arc<dyn DeliveryStorage> = Arc::new(storage.clone());
        let clock_dyn: Arc<dyn Clock> = Arc::new(clock.clone());
        let registry =
            Registry::new(storage_dyn.clone(), clock_dyn.clone(), RegistryConfig::default());
        let scheduler = TaskScheduler::new(
            storage_dyn.clone(),
            Arc::new(queue.clone()),
            clock_dyn.clone(),
            Duration::from_secs(180),
        );
        let dispatcher = Dispatcher::new(registry, storage_dyn, scheduler, clock_dyn);
        Fixture { storage, queue, clock, dispatcher, workspace_id: WorkspaceId::new() }
    }

    async fn subscribe(f: &Fixture, event_type: &str, attempts: Vec<u64>) -> Endpoint {
        let mut endpoint = Endpoint::new(f.workspace_id, "https://example.com/hook");
        endpoint.events = vec![event_type.to_string()];
        endpoint.retry = RetryConfig::fixed(attempts);
        f.storage.add_endpoint(endpoint.clone()).await;
        endpoint
    }

    #[tokio::test]
    async fn fanout_creates_one_initial_attempt_per_endpoint() {
        let f = fixture();
        let a = subscribe(&f, "foo.bar", vec![0, 60]).await;
        let b = subscribe(&f, "foo.bar", vec![30]).await;
        subscribe(&f, "other", vec![0]).await;

        let attempts = f
            .dispatcher
            .dispatch(f.workspace_id, vec![Event::new("foo.bar", json!({"n": 1}))])
            .await
            .unwrap();

        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|at| at.attempt_number == 1
            && at.status == AttemptStatus::Init
            && at.trigger_mode == TriggerMode::Initial
            && at.workspace_id == f.workspace_id));
        let now = f.clock.now_utc();
        let by_endpoint: HashMap<_, _> = attempts.iter().map(|at| (at.endpoint_id, at)).collect();
        assert_eq!(by_endpoint[&a.id].scheduled_at, now);
        assert_eq!(by_endpoint[&b.id].scheduled_at, now + chrono::Duration::seconds(30));

        // Both are inside the pre-schedule window.
        assert_eq!(f.queue.len().await, 2);
        assert_eq!(f.storage.attempts_with_status(AttemptStatus::Queued).await.len(), 2);
        assert_eq!(f.dispatcher.events_persisted(), 1);
    }

    #[tokio::test]
    async fn duplicate_unique_ids_are_dropped() {
        let f = fixture();
        subscribe(&f, "foo.bar", vec![0]).await;

        let first = Event::new("foo.bar", json!({})).with_unique_id("order-1");
        f.dispatcher.dispatch(f.workspace_id, vec![first]).await.unwrap();

        let again = Event::new("foo.bar", json!({})).with_unique_id("order-1");
        let twin_a = Event::new("foo.bar", json!({})).with_unique_id("order-2");
        let twin_b = Event::new("foo.bar", json!({})).with_unique_id("order-2");
        let attempts = f
            .dispatcher
            .dispatch(f.workspace_id, vec![again, twin_a.clone(), twin_b])
            .await
            .unwrap();

        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].event_id, twin_a.id);
        assert_eq!(f.storage.events().await.len(), 2);
        assert_eq!(f.storage.attempts().await.len(), 2);
    }

    #[tokio::test]
    async fn events_without_subscribers_are_stored() {
        let f = fixture();

        let attempts = f
            .dispatcher
            .dispatch(f.workspace_id, vec![Event::new("nobody.cares", json!({}))])
            .await
            .unwrap();

        assert!(attempts.is_empty());
        let stored = f.storage.events().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].workspace_id, f.workspace_id);
    }

    #[tokio::test]
    async fn transaction_failure_persists_nothing() {
        let f = fixture();
        subscribe(&f, "foo.bar", vec![0]).await;
        f.storage.fail_next_transaction("serialization failure").await;

        let result =
            f.dispatcher.dispatch(f.workspace_id, vec![Event::new("foo.bar", json!({}))]).await;

        assert!(result.is_err());
        assert!(f.storage.events().await.is_empty());
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn queue_failure_is_not_returned() {
        let f = fixture();
        subscribe(&f, "foo.bar", vec![0]).await;
        f.queue.fail_next("redis down").await;

        let attempts = f
            .dispatcher
            .dispatch(f.workspace_id, vec![Event::new("foo.bar", json!({}))])
            .await
            .unwrap();

        assert_eq!(attempts.len(), 1);
        assert_eq!(f.storage.attempts_with_status(AttemptStatus::Init).await.len(), 1);
    }

    #[tokio::test]
    async fn manual_dispatch_targets_given_endpoints() {
        let f = fixture();
        let endpoint = subscribe(&f, "foo.bar", vec![0, 60]).await;
        let mut event = Event::new("foo.bar", json!({"n": 2}));
        event.workspace_id = f.workspace_id;
        f.storage.insert_events(vec![event.clone()]).await.unwrap();

        let attempts = f.dispatcher.dispatch_endpoint(&event, &[endpoint.clone()]).await.unwrap();

        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].trigger_mode, TriggerMode::Manual);
        assert_eq!(attempts[0].endpoint_id, endpoint.id);
        assert!(f.queue.contains(attempts[0].id).await);
    }
}
