//! Storage abstraction layer for dispatch and delivery.
//!
//! Provides trait-based abstractions over storage operations to enable
//! testability without database dependencies. Production implementations
//! use the concrete `hookwire_core::storage::Storage` while tests can
//! provide mock implementations for deterministic behavior validation.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use hookwire_core::{
    error::Result,
    models::{
        Attempt, AttemptDetail, AttemptId, AttemptResult, Endpoint, EndpointId, ErrorCode, Event,
        EventId, WorkspaceId,
    },
};

/// Terminal result of one delivery, written as a single unit.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    /// Attempt being completed.
    pub attempt_id: AttemptId,
    /// Terminal status, snapshots and timestamps.
    pub result: AttemptResult,
    /// Request and response material.
    pub detail: AttemptDetail,
    /// Successor attempt when a retry follows.
    pub next: Option<Attempt>,
}

/// Storage operations required by the dispatcher, worker and requeue sweep.
///
/// This trait abstracts all database operations needed for webhook
/// delivery, enabling both production PostgreSQL implementations and
/// lightweight test doubles.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Lists every workspace id, used to warm the registry.
    fn list_workspace_ids(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WorkspaceId>>> + Send + '_>>;

    /// Lists enabled endpoints of a workspace in store order.
    fn list_enabled_endpoints(
        &self,
        workspace_id: WorkspaceId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Endpoint>>> + Send + '_>>;

    /// Returns which of `unique_ids` are already taken in the workspace.
    fn find_existing_unique_ids(
        &self,
        workspace_id: WorkspaceId,
        unique_ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>>;

    /// Inserts events outside a transaction, skipping conflicts.
    ///
    /// Returns the ids that were written.
    fn insert_events(
        &self,
        events: Vec<Event>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventId>>> + Send + '_>>;

    /// Inserts events and their attempts in one transaction.
    ///
    /// Events that collide with an existing row are skipped, and so are the
    /// attempts that belong to them. Returns the ids of the events and the
    /// attempts actually written.
    fn insert_events_with_attempts(
        &self,
        events: Vec<Event>,
        attempts: Vec<Attempt>,
    ) -> Pin<Box<dyn Future<Output = Result<(Vec<EventId>, Vec<Attempt>)>> + Send + '_>>;

    /// Inserts attempts for events that already exist.
    fn insert_attempts(
        &self,
        attempts: Vec<Attempt>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Finds an endpoint regardless of its enabled flag.
    fn find_endpoint(
        &self,
        endpoint_id: EndpointId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Endpoint>>> + Send + '_>>;

    /// Loads events by id; missing ids are skipped.
    fn find_events(
        &self,
        event_ids: Vec<EventId>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Event>>> + Send + '_>>;

    /// Cancels a non-terminal attempt. Returns false if it was already final.
    fn cancel_attempt(
        &self,
        attempt_id: AttemptId,
        error_code: ErrorCode,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Writes an attempt outcome, its detail and its successor atomically.
    ///
    /// Returns false without writing anything when the attempt is already
    /// terminal, which happens when a reclaimed task is delivered twice.
    fn record_outcome(
        &self,
        outcome: AttemptOutcome,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Moves attempts still in `INIT` to `QUEUED`.
    fn mark_queued(
        &self,
        attempt_ids: Vec<AttemptId>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;

    /// Lists `INIT` attempts old enough and due soon enough to requeue,
    /// ordered by `(scheduled_at, id)` and starting strictly after `after`.
    fn list_unqueued(
        &self,
        created_before: DateTime<Utc>,
        scheduled_before: DateTime<Utc>,
        after: Option<(DateTime<Utc>, AttemptId)>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Attempt>>> + Send + '_>>;

    /// Lists every attempt of an event.
    fn find_attempts_by_event(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Attempt>>> + Send + '_>>;
}

/// Production storage implementation using PostgreSQL.
///
/// Wraps the concrete `hookwire_core::storage::Storage` to implement the
/// `DeliveryStorage` trait. All database operations go through the
/// repository pattern for consistency and type safety.
#[derive(Clone)]
pub struct PostgresDeliveryStorage {
    storage: Arc<hookwire_core::storage::Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<hookwire_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn list_workspace_ids(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WorkspaceId>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.workspaces.list_ids().await })
    }

    fn list_enabled_endpoints(
        &self,
        workspace_id: WorkspaceId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Endpoint>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.endpoints.list_enabled(workspace_id).await })
    }

    fn find_existing_unique_ids(
        &self,
        workspace_id: WorkspaceId,
        unique_ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.events.find_existing_unique_ids(workspace_id, &unique_ids).await
        })
    }

    fn insert_events(
        &self,
        events: Vec<Event>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventId>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.events.insert_ignoring_conflicts(&events).await })
    }

    fn insert_events_with_attempts(
        &self,
        events: Vec<Event>,
        attempts: Vec<Attempt>,
    ) -> Pin<Box<dyn Future<Output = Result<(Vec<EventId>, Vec<Attempt>)>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            let mut tx = storage.begin().await?;

            let inserted = storage.events.insert_ignoring_conflicts_in_tx(&mut tx, &events).await?;
            let attempts: Vec<Attempt> =
                attempts.into_iter().filter(|a| inserted.contains(&a.event_id)).collect();
            storage.attempts.insert_batch_in_tx(&mut tx, &attempts).await?;

            tx.commit().await?;
            Ok((inserted, attempts))
        })
    }

    fn insert_attempts(
        &self,
        attempts: Vec<Attempt>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.attempts.insert_batch(&attempts).await })
    }

    fn find_endpoint(
        &self,
        endpoint_id: EndpointId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Endpoint>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.endpoints.find_by_id(endpoint_id).await })
    }

    fn find_events(
        &self,
        event_ids: Vec<EventId>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Event>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.events.find_by_ids(&event_ids).await })
    }

    fn cancel_attempt(
        &self,
        attempt_id: AttemptId,
        error_code: ErrorCode,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.attempts.cancel(attempt_id, error_code).await })
    }

    fn record_outcome(
        &self,
        outcome: AttemptOutcome,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            let mut tx = storage.begin().await?;

            let completed = storage
                .attempts
                .complete_in_tx(&mut tx, outcome.attempt_id, &outcome.result)
                .await?;
            if !completed {
                tx.rollback().await?;
                return Ok(false);
            }
            storage.attempt_details.upsert_in_tx(&mut tx, &outcome.detail).await?;
            if let Some(next) = &outcome.next {
                storage.attempts.insert_batch_in_tx(&mut tx, std::slice::from_ref(next)).await?;
            }

            tx.commit().await?;
            Ok(true)
        })
    }

    fn mark_queued(
        &self,
        attempt_ids: Vec<AttemptId>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.attempts.mark_queued(&attempt_ids).await })
    }

    fn list_unqueued(
        &self,
        created_before: DateTime<Utc>,
        scheduled_before: DateTime<Utc>,
        after: Option<(DateTime<Utc>, AttemptId)>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Attempt>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.attempts.list_unqueued(created_before, scheduled_before, after, limit).await
        })
    }

    fn find_attempts_by_event(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Attempt>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.attempts.find_by_event(event_id).await })
    }
}

pub mod mock {
    //! Mock storage implementation for testing.
    //!
    //! Provides deterministic, in-memory storage for testing dispatch and
    //! delivery logic without database dependencies. Supports injecting
    //! failures and slowing endpoint listing to exercise the registry.

    use std::{
        collections::HashMap,
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use chrono::{DateTime, Utc};
    use hookwire_core::{error::Result, models::AttemptStatus, CoreError};
    use tokio::sync::RwLock;

    use super::{
        Attempt, AttemptDetail, AttemptId, AttemptOutcome, DeliveryStorage, Endpoint, EndpointId,
        ErrorCode, Event, EventId, WorkspaceId,
    };

    #[derive(Debug, Default)]
    struct State {
        workspaces: Vec<WorkspaceId>,
        endpoints: Vec<Endpoint>,
        events: Vec<Event>,
        attempts: Vec<Attempt>,
        details: HashMap<AttemptId, AttemptDetail>,
    }

    impl State {
        fn insert_events(&mut self, events: Vec<Event>) -> Vec<EventId> {
            let mut inserted = Vec::new();
            for event in events {
                let conflict = self.events.iter().any(|existing| {
                    existing.id == event.id
                        || (event.unique_id.is_some()
                            && existing.workspace_id == event.workspace_id
                            && existing.unique_id == event.unique_id)
                });
                if !conflict {
                    inserted.push(event.id);
                    self.events.push(event);
                }
            }
            inserted
        }

        fn attempt_mut(&mut self, id: AttemptId) -> Option<&mut Attempt> {
            self.attempts.iter_mut().find(|a| a.id == id)
        }
    }

    /// Mock storage for testing delivery logic without database.
    #[derive(Debug, Clone, Default)]
    pub struct MockDeliveryStorage {
        state: Arc<RwLock<State>>,
        transaction_error: Arc<RwLock<Option<String>>>,
        endpoint_list_error: Arc<RwLock<Option<String>>>,
        endpoint_list_delay: Arc<RwLock<Option<Duration>>>,
        endpoint_list_calls: Arc<AtomicUsize>,
    }

    impl MockDeliveryStorage {
        /// Creates a new mock storage with empty state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers a workspace without endpoints.
        pub async fn add_workspace(&self, workspace_id: WorkspaceId) {
            let mut state = self.state.write().await;
            if !state.workspaces.contains(&workspace_id) {
                state.workspaces.push(workspace_id);
            }
        }

        /// Stores an endpoint, registering its workspace.
        pub async fn add_endpoint(&self, endpoint: Endpoint) {
            self.add_workspace(endpoint.workspace_id).await;
            let mut state = self.state.write().await;
            state.endpoints.retain(|e| e.id != endpoint.id);
            state.endpoints.push(endpoint);
        }

        /// Flips an endpoint's enabled flag. Returns false if it is unknown.
        pub async fn set_endpoint_enabled(&self, endpoint_id: EndpointId, enabled: bool) -> bool {
            let mut state = self.state.write().await;
            match state.endpoints.iter_mut().find(|e| e.id == endpoint_id) {
                Some(endpoint) => {
                    endpoint.enabled = enabled;
                    endpoint.updated_at = Utc::now();
                    true
                },
                None => false,
            }
        }

        /// Deletes an endpoint.
        pub async fn remove_endpoint(&self, endpoint_id: EndpointId) {
            self.state.write().await.endpoints.retain(|e| e.id != endpoint_id);
        }

        /// Makes the next transactional write fail.
        pub async fn fail_next_transaction(&self, error: impl Into<String>) {
            *self.transaction_error.write().await = Some(error.into());
        }

        /// Makes the next endpoint listing fail.
        pub async fn fail_next_endpoint_list(&self, error: impl Into<String>) {
            *self.endpoint_list_error.write().await = Some(error.into());
        }

        /// Delays every endpoint listing.
        pub async fn set_endpoint_list_delay(&self, delay: Duration) {
            *self.endpoint_list_delay.write().await = Some(delay);
        }

        /// How many times endpoints were listed.
        pub fn endpoint_list_calls(&self) -> usize {
            self.endpoint_list_calls.load(Ordering::SeqCst)
        }

        /// Every stored event.
        pub async fn events(&self) -> Vec<Event> {
            self.state.read().await.events.clone()
        }

        /// Every stored attempt in insertion order.
        pub async fn attempts(&self) -> Vec<Attempt> {
            self.state.read().await.attempts.clone()
        }

        /// One attempt by id.
        pub async fn attempt(&self, id: AttemptId) -> Option<Attempt> {
            self.state.read().await.attempts.iter().find(|a| a.id == id).cloned()
        }

        /// Attempts in the given status.
        pub async fn attempts_with_status(&self, status: AttemptStatus) -> Vec<Attempt> {
            let state = self.state.read().await;
            state.attempts.iter().filter(|a| a.status == status).cloned().collect()
        }

        /// Detail recorded for an attempt.
        pub async fn detail(&self, id: AttemptId) -> Option<AttemptDetail> {
            self.state.read().await.details.get(&id).cloned()
        }

        async fn take_transaction_error(&self) -> Result<()> {
            match self.transaction_error.write().await.take() {
                Some(error) => Err(CoreError::Database(error)),
                None => Ok(()),
            }
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn list_workspace_ids(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<WorkspaceId>>> + Send + '_>> {
            Box::pin(async move { Ok(self.state.read().await.workspaces.clone()) })
        }

        fn list_enabled_endpoints(
            &self,
            workspace_id: WorkspaceId,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Endpoint>>> + Send + '_>> {
            Box::pin(async move {
                self.endpoint_list_calls.fetch_add(1, Ordering::SeqCst);
                let delay = *self.endpoint_list_delay.read().await;
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if let Some(error) = self.endpoint_list_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }

                Ok(self
                    .state
                    .read()
                    .await
                    .endpoints
                    .iter()
                    .filter(|e| e.workspace_id == workspace_id && e.enabled)
                    .cloned()
                    .collect())
            })
        }

        fn find_existing_unique_ids(
            &self,
            workspace_id: WorkspaceId,
            unique_ids: Vec<String>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>> {
            Box::pin(async move {
                let state = self.state.read().await;
                Ok(unique_ids
                    .into_iter()
                    .filter(|unique_id| {
                        state.events.iter().any(|e| {
                            e.workspace_id == workspace_id
                                && e.unique_id.as_deref() == Some(unique_id.as_str())
                        })
                    })
                    .collect())
            })
        }

        fn insert_events(
            &self,
            events: Vec<Event>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<EventId>>> + Send + '_>> {
            Box::pin(async move { Ok(self.state.write().await.insert_events(events)) })
        }

        fn insert_events_with_attempts(
            &self,
            events: Vec<Event>,
            attempts: Vec<Attempt>,
        ) -> Pin<Box<dyn Future<Output = Result<(Vec<EventId>, Vec<Attempt>)>> + Send + '_>> {
            Box::pin(async move {
                self.take_transaction_error().await?;

                let mut state = self.state.write().await;
                let inserted = state.insert_events(events);
                let attempts: Vec<Attempt> =
                    attempts.into_iter().filter(|a| inserted.contains(&a.event_id)).collect();
                state.attempts.extend(attempts.iter().cloned());
                Ok((inserted, attempts))
            })
        }

        fn insert_attempts(
            &self,
            attempts: Vec<Attempt>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.state.write().await.attempts.extend(attempts);
                Ok(())
            })
        }

        fn find_endpoint(
            &self,
            endpoint_id: EndpointId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Endpoint>>> + Send + '_>> {
            Box::pin(async move {
                Ok(self.state.read().await.endpoints.iter().find(|e| e.id == endpoint_id).cloned())
            })
        }

        fn find_events(
            &self,
            event_ids: Vec<EventId>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Event>>> + Send + '_>> {
            Box::pin(async move {
                Ok(self
                    .state
                    .read()
                    .await
                    .events
                    .iter()
                    .filter(|e| event_ids.contains(&e.id))
                    .cloned()
                    .collect())
            })
        }

        fn cancel_attempt(
            &self,
            attempt_id: AttemptId,
            error_code: ErrorCode,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                match state.attempt_mut(attempt_id) {
                    Some(attempt) if !attempt.status.is_terminal() => {
                        attempt.status = AttemptStatus::Canceled;
                        attempt.error_code = Some(error_code);
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn record_outcome(
            &self,
            outcome: AttemptOutcome,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            Box::pin(async move {
                self.take_transaction_error().await?;

                let mut state = self.state.write().await;
                match state.attempt_mut(outcome.attempt_id) {
                    Some(stored) if !stored.status.is_terminal() => {
                        stored.apply(&outcome.result);
                    },
                    _ => return Ok(false),
                }
                state.details.insert(outcome.detail.id, outcome.detail);
                if let Some(next) = outcome.next {
                    state.attempts.push(next);
                }
                Ok(true)
            })
        }

        fn mark_queued(
            &self,
            attempt_ids: Vec<AttemptId>,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let mut updated = 0;
                for attempt in state.attempts.iter_mut() {
                    if attempt.status == AttemptStatus::Init && attempt_ids.contains(&attempt.id) {
                        attempt.status = AttemptStatus::Queued;
                        updated += 1;
                    }
                }
                Ok(updated)
            })
        }

        fn list_unqueued(
            &self,
            created_before: DateTime<Utc>,
            scheduled_before: DateTime<Utc>,
            after: Option<(DateTime<Utc>, AttemptId)>,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Attempt>>> + Send + '_>> {
            Box::pin(async move {
                let state = self.state.read().await;
                let mut due: Vec<Attempt> = state
                    .attempts
                    .iter()
                    .filter(|a| {
                        a.status == AttemptStatus::Init
                            && a.created_at <= created_before
                            && a.scheduled_at <= scheduled_before
                            && after.map_or(true, |key| (a.scheduled_at, a.id) > key)
                    })
                    .cloned()
                    .collect();
                due.sort_by_key(|a| (a.scheduled_at, a.id));
                due.truncate(limit);
                Ok(due)
            })
        }

        fn find_attempts_by_event(
            &self,
            event_id: EventId,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Attempt>>> + Send + '_>> {
            Box::pin(async move {
                let mut attempts: Vec<Attempt> = self
                    .state
                    .read()
                    .await
                    .attempts
                    .iter()
                    .filter(|a| a.event_id == event_id)
                    .cloned()
                    .collect();
                attempts.sort_by_key(|a| (a.endpoint_id, a.attempt_number));
                Ok(attempts)
            })
        }
    }
}
