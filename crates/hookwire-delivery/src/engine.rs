//! Webhook delivery engine with worker pool and reliability guarantees.
//!
//! The engine wires the pieces of the pipeline together and owns their
//! lifecycle: dispatcher and registry for intake, a pool of workers claiming
//! from the work queue, the requeue sweep and a queue stats sampler.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌─────────────┐   ┌─────────────┐
//! │ Dispatcher │──▶│ TaskScheduler│──▶│ Work Queue  │──▶│ Worker Pool │
//! └────────────┘   └──────────────┘   └─────────────┘   └─────────────┘
//!       │                 ▲                                    │
//!       ▼                 │                                    ▼
//! ┌────────────┐   ┌──────────────┐                     ┌─────────────┐
//! │ PostgreSQL │◀──│ Requeue Sweep│                     │ HTTP Client │
//! └────────────┘   └──────────────┘                     └─────────────┘
//! ```

use std::{sync::Arc, time::Duration};

use hookwire_core::{events::EventHandler, time::Clock};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    acl::Acl,
    client::{ClientConfig, DeliveryClient},
    dispatcher::Dispatcher,
    error::Result,
    hook::OutboundHook,
    queue::{QueueStats, TaskQueue},
    registry::{Registry, RegistryConfig},
    requeue::{RequeueConfig, RequeueSweep},
    scheduler::TaskScheduler,
    storage::DeliveryStorage,
    worker::{DeliveryWorker, WorkerContext},
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Maximum tasks to claim per worker batch.
    pub batch_size: usize,

    /// How often idle workers poll for new tasks.
    pub poll_interval: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Egress deny rules: IPs, CIDRs, domains and `@` presets.
    pub acl_rules: Vec<String>,

    /// Shutdown timeout - maximum time to wait for workers to complete.
    pub shutdown_timeout: Duration,

    /// Requeue sweep settings.
    pub requeue: RequeueConfig,

    /// Attempts due within this window are queued right away.
    pub pre_schedule_window: Duration,

    /// How often queue stats are sampled.
    pub stats_interval: Duration,

    /// Endpoint registry cache settings.
    pub registry: RegistryConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            client_config: ClientConfig::default(),
            acl_rules: Vec::new(),
            shutdown_timeout: Duration::from_secs(30),
            requeue: RequeueConfig::default(),
            pre_schedule_window: Duration::from_secs(crate::DEFAULT_PRE_SCHEDULE_WINDOW_SECONDS),
            stats_interval: Duration::from_secs(15),
            registry: RegistryConfig::default(),
        }
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Number of active delivery workers.
    pub active_workers: usize,
    /// Attempts driven to a terminal state since startup.
    pub attempts_total: u64,
    /// Attempts that got a 2xx.
    pub attempts_succeeded: u64,
    /// Attempts that failed, exhausted or not.
    pub attempts_failed: u64,
    /// Failed attempts with no successor.
    pub attempts_exhausted: u64,
    /// Attempts canceled because the endpoint was gone or disabled.
    pub attempts_canceled: u64,
    /// Tasks whose attempt was already terminal.
    pub duplicate_tasks: u64,
    /// Requests currently on the wire.
    pub in_flight_deliveries: u64,
    /// Events persisted by the dispatcher.
    pub events_persisted: u64,
    /// Last sampled queue stats.
    pub queue: Option<QueueStats>,
}

/// Main delivery engine coordinating dispatch and delivery workers.
pub struct DeliveryEngine {
    config: DeliveryConfig,
    ctx: WorkerContext,
    dispatcher: Dispatcher,
    requeue: RequeueSweep,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Creates a new delivery engine.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the HTTP client cannot be built.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
        hook: Arc<dyn OutboundHook>,
        config: DeliveryConfig,
    ) -> Result<Self> {
        for rule in &config.acl_rules {
            if let Err(reason) = Acl::validate_rule(rule) {
                warn!(rule = %rule, reason = %reason, "acl rule kept as an exact host match");
            }
        }
        let acl = Arc::new(Acl::new(&config.acl_rules));
        let client = Arc::new(DeliveryClient::new(config.client_config.clone(), acl)?);

        let registry = Registry::new(storage.clone(), clock.clone(), config.registry.clone());
        let scheduler = TaskScheduler::new(
            storage.clone(),
            queue.clone(),
            clock.clone(),
            config.pre_schedule_window,
        );
        let dispatcher =
            Dispatcher::new(registry, storage.clone(), scheduler.clone(), clock.clone());
        let requeue = RequeueSweep::new(
            storage.clone(),
            scheduler.clone(),
            clock.clone(),
            config.requeue.clone(),
        );

        let ctx = WorkerContext {
            storage,
            queue,
            scheduler,
            client,
            hook,
            event_handler,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            clock,
            config: config.clone(),
        };

        Ok(Self {
            config,
            ctx,
            dispatcher,
            requeue,
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
        })
    }

    /// Starts workers, the requeue sweep and the stats sampler.
    ///
    /// Warms the registry first; a failed warm-up is logged and registrations
    /// load lazily instead.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            "starting webhook delivery engine"
        );

        if let Err(error) = self.dispatcher.registry().warmup().await {
            warn!(error = %error, "registry warm-up failed, loading lazily");
        }

        let mut worker_pool = WorkerPool::new(
            self.ctx.clone(),
            self.config.worker_count,
            self.cancellation_token.clone(),
        );
        worker_pool.spawn_workers().await;

        let sweep = self.requeue.clone();
        worker_pool.spawn_background("requeue", |token| async move { sweep.run(token).await });

        let sampler = StatsSampler {
            queue: self.ctx.queue.clone(),
            dispatcher: self.dispatcher.clone(),
            stats: self.ctx.stats.clone(),
            clock: self.ctx.clock.clone(),
            interval: self.config.stats_interval,
        };
        worker_pool
            .spawn_background("queue-stats", |token| async move { sampler.run(token).await });

        self.worker_pool = Some(worker_pool);

        info!("delivery engine started successfully");
        Ok(())
    }

    /// Gracefully shuts down the delivery engine, allowing in-flight deliveries
    /// to complete within the configured timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
            Ok(())
        }
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        let mut stats = self.ctx.stats.read().await.clone();
        stats.events_persisted = self.dispatcher.events_persisted();
        stats
    }

    /// Dispatcher for event intake.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Claims and processes one batch on the calling task.
    ///
    /// # Errors
    ///
    /// Returns the claim error.
    pub async fn process_batch(&self) -> Result<usize> {
        DeliveryWorker::new(0, self.ctx.clone(), self.cancellation_token.clone())
            .process_batch()
            .await
    }

    /// Runs one requeue sweep on the calling task.
    ///
    /// # Errors
    ///
    /// Returns the first storage or queue error.
    pub async fn requeue_once(&self) -> Result<usize> {
        self.requeue.run_once().await
    }

    /// Samples queue stats into the engine stats.
    ///
    /// # Errors
    ///
    /// Returns the queue error.
    pub async fn sample_queue_stats(&self) -> Result<QueueStats> {
        let queue_stats = self.ctx.queue.stats().await?;
        self.ctx.stats.write().await.queue = Some(queue_stats);
        Ok(queue_stats)
    }
}

struct StatsSampler {
    queue: Arc<dyn TaskQueue>,
    dispatcher: Dispatcher,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl StatsSampler {
    async fn run(&self, cancellation_token: CancellationToken) {
        loop {
            tokio::select! {
                () = self.clock.sleep(self.interval) => {}
                () = cancellation_token.cancelled() => break,
            }

            match self.queue.stats().await {
                Ok(queue_stats) => {
                    debug!(
                        depth = queue_stats.depth,
                        backlog_ms = queue_stats.backlog_latency.as_millis(),
                        "queue stats sampled"
                    );
                    let mut stats = self.stats.write().await;
                    stats.queue = Some(queue_stats);
                    stats.events_persisted = self.dispatcher.events_persisted();
                },
                Err(error) => warn!(error = %error, "queue stats sampling failed"),
            }
        }
    }
}
