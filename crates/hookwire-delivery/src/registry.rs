//! Per-workspace endpoint registry.
//!
//! Maps `(workspace, event type)` to the enabled endpoints subscribed to it.
//! Registrations are cached in an LRU with a TTL measured on the injected
//! clock. Concurrent misses for one workspace share a single load; a failed
//! load reaches every waiter and is never cached. Unregistering a workspace
//! bumps its generation, so a load that started earlier is never cached.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::future::{BoxFuture, FutureExt, Shared};
use hookwire_core::{
    models::{Endpoint, WorkspaceId},
    time::Clock,
};
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{error::Result, storage::DeliveryStorage};

/// Registry cache sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Maximum number of cached workspaces.
    pub capacity: NonZeroUsize,
    /// How long a registration stays fresh.
    pub ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(100).unwrap_or(NonZeroUsize::MIN),
            ttl: Duration::from_secs(60),
        }
    }
}

/// Enabled endpoints of one workspace grouped by subscribed event type.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    by_event_type: HashMap<String, Vec<Endpoint>>,
    endpoint_count: usize,
}

impl Registration {
    /// Groups endpoints by event type, keeping their order within each type.
    pub fn from_endpoints(endpoints: Vec<Endpoint>) -> Self {
        let endpoint_count = endpoints.len();
        let mut by_event_type: HashMap<String, Vec<Endpoint>> = HashMap::new();
        for endpoint in endpoints {
            for event_type in &endpoint.events {
                let bucket = by_event_type.entry(event_type.clone()).or_default();
                if !bucket.iter().any(|e| e.id == endpoint.id) {
                    bucket.push(endpoint.clone());
                }
            }
        }
        Self { by_event_type, endpoint_count }
    }

    /// Endpoints subscribed to `event_type`.
    pub fn endpoints_for(&self, event_type: &str) -> &[Endpoint] {
        self.by_event_type.get(event_type).map_or(&[], Vec::as_slice)
    }

    /// Number of endpoints the registration was built from.
    pub fn endpoint_count(&self) -> usize {
        self.endpoint_count
    }
}

struct CacheEntry {
    registration: Arc<Registration>,
    loaded_at: Instant,
}

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<Registration>>>>;

#[derive(Default)]
struct Inflight {
    loads: HashMap<WorkspaceId, LoadFuture>,
    generations: HashMap<WorkspaceId, u64>,
}

impl Inflight {
    fn generation(&self, workspace_id: WorkspaceId) -> u64 {
        self.generations.get(&workspace_id).copied().unwrap_or_default()
    }
}

struct Inner {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cache: Mutex<LruCache<WorkspaceId, CacheEntry>>,
    // Lock order: `inflight` before `cache`.
    inflight: Mutex<Inflight>,
}

impl Inner {
    async fn cached(&self, workspace_id: WorkspaceId) -> Option<Arc<Registration>> {
        let mut cache = self.cache.lock().await;
        let entry = cache.get(&workspace_id)?;
        if self.clock.now().saturating_duration_since(entry.loaded_at) < self.ttl {
            return Some(entry.registration.clone());
        }
        cache.pop(&workspace_id);
        None
    }

    async fn load(&self, workspace_id: WorkspaceId) -> Result<Arc<Registration>> {
        let endpoints = self.storage.list_enabled_endpoints(workspace_id).await?;
        let registration = Arc::new(Registration::from_endpoints(endpoints));
        debug!(
            %workspace_id,
            endpoints = registration.endpoint_count(),
            "loaded workspace registration"
        );
        Ok(registration)
    }
}

/// Cached, single-flight view of endpoint registrations.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        clock: Arc<dyn Clock>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                clock,
                ttl: config.ttl,
                cache: Mutex::new(LruCache::new(config.capacity)),
                inflight: Mutex::new(Inflight::default()),
            }),
        }
    }

    /// Enabled endpoints of `workspace_id` subscribed to `event_type`.
    ///
    /// # Errors
    ///
    /// Returns the load error when the workspace is not cached and the
    /// store cannot be read.
    pub async fn lookup(
        &self,
        workspace_id: WorkspaceId,
        event_type: &str,
    ) -> Result<Vec<Endpoint>> {
        let registration = self.registration(workspace_id).await?;
        Ok(registration.endpoints_for(event_type).to_vec())
    }

    /// The registration of a workspace, loading it on a miss.
    ///
    /// # Errors
    ///
    /// Returns the load error shared by every concurrent caller.
    pub async fn registration(&self, workspace_id: WorkspaceId) -> Result<Arc<Registration>> {
        if let Some(registration) = self.inner.cached(workspace_id).await {
            return Ok(registration);
        }

        let load = {
            let mut inflight = self.inner.inflight.lock().await;
            // A load may have finished between the miss and taking the lock.
            if let Some(registration) = self.inner.cached(workspace_id).await {
                return Ok(registration);
            }
            match inflight.loads.get(&workspace_id) {
                Some(load) => load.clone(),
                None => {
                    let load = self.start_load(workspace_id, inflight.generation(workspace_id));
                    inflight.loads.insert(workspace_id, load.clone());
                    load
                },
            }
        };

        load.await
    }

    /// The load caches its own result and clears its in-flight slot, so it
    /// completes correctly whichever waiter ends up driving it. Both steps are
    /// skipped when the workspace was unregistered while the load ran; its
    /// slot then belongs to a newer load, if any.
    fn start_load(&self, workspace_id: WorkspaceId, generation: u64) -> LoadFuture {
        let inner = self.inner.clone();
        async move {
            let result = inner.load(workspace_id).await;
            let mut inflight = inner.inflight.lock().await;
            if inflight.generation(workspace_id) != generation {
                debug!(%workspace_id, "discarding registration loaded before unregister");
                return result;
            }
            if let Ok(registration) = &result {
                let entry =
                    CacheEntry { registration: registration.clone(), loaded_at: inner.clock.now() };
                inner.cache.lock().await.put(workspace_id, entry);
            }
            inflight.loads.remove(&workspace_id);
            result
        }
        .boxed()
        .shared()
    }

    /// Loads every workspace. Returns how many registrations were loaded.
    ///
    /// # Errors
    ///
    /// Returns the first listing or load failure.
    pub async fn warmup(&self) -> Result<usize> {
        let workspace_ids = self.inner.storage.list_workspace_ids().await?;
        for workspace_id in &workspace_ids {
            self.registration(*workspace_id).await?;
        }
        info!(workspaces = workspace_ids.len(), "registry warmed up");
        Ok(workspace_ids.len())
    }

    /// Drops the cached registration of a workspace along with any load
    /// still in flight for it.
    pub async fn unregister(&self, workspace_id: WorkspaceId) {
        let mut inflight = self.inner.inflight.lock().await;
        *inflight.generations.entry(workspace_id).or_default() += 1;
        inflight.loads.remove(&workspace_id);
        self.inner.cache.lock().await.pop(&workspace_id);
    }

    /// Number of cached workspaces, fresh or not.
    pub async fn cached_len(&self) -> usize {
        self.inner.cache.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use hookwire_core::time::TestClock;

    use super::*;
    use crate::{error::DeliveryError, storage::mock::MockDeliveryStorage};

    fn endpoint(workspace_id: WorkspaceId, events: &[&str]) -> Endpoint {
        let mut endpoint = Endpoint::new(workspace_id, "https://example.com/hook");
        endpoint.events = events.iter().map(|e| (*e).to_string()).collect();
        endpoint
    }

    fn registry(storage: &MockDeliveryStorage, clock: &TestClock, capacity: usize) -> Registry {
        let config = RegistryConfig {
            capacity: NonZeroUsize::new(capacity).unwrap(),
            ttl: Duration::from_secs(60),
        };
        Registry::new(Arc::new(storage.clone()), Arc::new(clock.clone()), config)
    }

    #[tokio::test]
    async fn lookup_filters_by_event_type_in_store_order() {
        let storage = MockDeliveryStorage::new();
        let workspace_id = WorkspaceId::new();
        let first = endpoint(workspace_id, &["order.created", "order.paid"]);
        let second = endpoint(workspace_id, &["order.created"]);
        let mut disabled = endpoint(workspace_id, &["order.created"]);
        disabled.enabled = false;
        storage.add_endpoint(first.clone()).await;
        storage.add_endpoint(second.clone()).await;
        storage.add_endpoint(disabled).await;

        let registry = registry(&storage, &TestClock::new(), 10);

        let created = registry.lookup(workspace_id, "order.created").await.unwrap();
        assert_eq!(created.iter().map(|e| e.id).collect::<Vec<_>>(), vec![first.id, second.id]);
        assert_eq!(registry.lookup(workspace_id, "order.paid").await.unwrap().len(), 1);
        assert!(registry.lookup(workspace_id, "order.refunded").await.unwrap().is_empty());
        assert!(registry.lookup(WorkspaceId::new(), "order.created").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let workspace_id = WorkspaceId::new();
        storage.add_endpoint(endpoint(workspace_id, &["a"])).await;
        let registry = registry(&storage, &clock, 10);

        registry.lookup(workspace_id, "a").await.unwrap();
        clock.advance(Duration::from_secs(59));
        registry.lookup(workspace_id, "a").await.unwrap();
        assert_eq!(storage.endpoint_list_calls(), 1);

        clock.advance(Duration::from_secs(1));
        registry.lookup(workspace_id, "a").await.unwrap();
        assert_eq!(storage.endpoint_list_calls(), 2);
    }

    #[tokio::test]
    async fn least_recently_used_workspace_is_evicted() {
        let storage = MockDeliveryStorage::new();
        let (a, b) = (WorkspaceId::new(), WorkspaceId::new());
        let registry = registry(&storage, &TestClock::new(), 1);

        registry.lookup(a, "x").await.unwrap();
        registry.lookup(b, "x").await.unwrap();
        assert_eq!(registry.cached_len().await, 1);

        registry.lookup(a, "x").await.unwrap();
        assert_eq!(storage.endpoint_list_calls(), 3);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_load() {
        let storage = MockDeliveryStorage::new();
        let workspace_id = WorkspaceId::new();
        storage.add_endpoint(endpoint(workspace_id, &["a"])).await;
        storage.set_endpoint_list_delay(Duration::from_millis(50)).await;
        let registry = registry(&storage, &TestClock::new(), 10);

        let lookups = (0..16).map(|_| registry.lookup(workspace_id, "a"));
        let results = futures::future::join_all(lookups).await;

        assert!(results.iter().all(|r| r.as_ref().map(Vec::len).ok() == Some(1)));
        assert_eq!(storage.endpoint_list_calls(), 1);
    }

    #[tokio::test]
    async fn failed_load_reaches_all_waiters_and_is_not_cached() {
        let storage = MockDeliveryStorage::new();
        let workspace_id = WorkspaceId::new();
        storage.add_endpoint(endpoint(workspace_id, &["a"])).await;
        storage.set_endpoint_list_delay(Duration::from_millis(20)).await;
        storage.fail_next_endpoint_list("connection refused").await;
        let registry = registry(&storage, &TestClock::new(), 10);

        let (first, second) =
            tokio::join!(registry.lookup(workspace_id, "a"), registry.lookup(workspace_id, "a"));
        assert!(matches!(first, Err(DeliveryError::DatabaseError { .. })));
        assert!(matches!(second, Err(DeliveryError::DatabaseError { .. })));
        assert_eq!(registry.cached_len().await, 0);

        assert_eq!(registry.lookup(workspace_id, "a").await.unwrap().len(), 1);
        assert_eq!(storage.endpoint_list_calls(), 2);
    }

    #[tokio::test]
    async fn unregister_forces_reload() {
        let storage = MockDeliveryStorage::new();
        let workspace_id = WorkspaceId::new();
        let hook = endpoint(workspace_id, &["a"]);
        storage.add_endpoint(hook.clone()).await;
        let registry = registry(&storage, &TestClock::new(), 10);

        assert_eq!(registry.lookup(workspace_id, "a").await.unwrap().len(), 1);
        storage.set_endpoint_enabled(hook.id, false).await;
        assert_eq!(registry.lookup(workspace_id, "a").await.unwrap().len(), 1);

        registry.unregister(workspace_id).await;
        assert!(registry.lookup(workspace_id, "a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregister_during_load_discards_stale_registration() {
        let storage = MockDeliveryStorage::new();
        let workspace_id = WorkspaceId::new();
        storage.add_endpoint(endpoint(workspace_id, &["a"])).await;
        storage.set_endpoint_list_delay(Duration::from_millis(100)).await;
        let registry = registry(&storage, &TestClock::new(), 10);

        let pending = tokio::spawn({
            let registry = registry.clone();
            async move { registry.lookup(workspace_id, "a").await }
        });
        while storage.endpoint_list_calls() == 0 {
            tokio::task::yield_now().await;
        }
        registry.unregister(workspace_id).await;

        // The waiter still gets what its load read, but nothing is cached.
        assert_eq!(pending.await.unwrap().unwrap().len(), 1);
        assert_eq!(registry.cached_len().await, 0);

        storage.set_endpoint_list_delay(Duration::ZERO).await;
        assert_eq!(registry.lookup(workspace_id, "a").await.unwrap().len(), 1);
        assert_eq!(storage.endpoint_list_calls(), 2);
        assert_eq!(registry.cached_len().await, 1);
    }

    #[tokio::test]
    async fn warmup_loads_every_workspace() {
        let storage = MockDeliveryStorage::new();
        storage.add_endpoint(endpoint(WorkspaceId::new(), &["a"])).await;
        storage.add_endpoint(endpoint(WorkspaceId::new(), &["b"])).await;
        storage.add_workspace(WorkspaceId::new()).await;
        let registry = registry(&storage, &TestClock::new(), 10);

        assert_eq!(registry.warmup().await.unwrap(), 3);
        assert_eq!(registry.cached_len().await, 3);
    }
}
