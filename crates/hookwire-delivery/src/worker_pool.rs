//! Worker pool management with structured concurrency.
//!
//! Provides lifecycle management and graceful shutdown for delivery workers
//! and the background tasks that run beside them.

use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    worker::{DeliveryWorker, WorkerContext},
};

/// Supervised task, labelled for shutdown logs.
struct Supervised {
    name: String,
    handle: JoinHandle<Result<()>>,
}

/// Worker pool that manages delivery worker tasks with supervision.
///
/// All workers share one `WorkerContext` and one cancellation token.
/// Background tasks spawned through the pool are joined on shutdown the
/// same way workers are.
pub struct WorkerPool {
    ctx: WorkerContext,
    worker_count: usize,
    cancellation_token: CancellationToken,
    handles: Vec<Supervised>,
}

impl WorkerPool {
    /// Create a new worker pool running `worker_count` workers.
    pub fn new(
        ctx: WorkerContext,
        worker_count: usize,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { ctx, worker_count, cancellation_token, handles: Vec::new() }
    }

    /// Spawn all configured workers and begin processing.
    ///
    /// Workers will run until cancellation is requested via the cancellation
    /// token. Returns immediately after spawning all workers.
    pub async fn spawn_workers(&mut self) {
        info!(worker_count = self.worker_count, "spawning delivery workers");

        {
            let mut stats = self.ctx.stats.write().await;
            stats.active_workers = self.worker_count;
        }

        for worker_id in 0..self.worker_count {
            let worker =
                DeliveryWorker::new(worker_id, self.ctx.clone(), self.cancellation_token.clone());

            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(
                        worker_id,
                        error = %error,
                        "delivery worker terminated with error"
                    );
                } else {
                    info!(worker_id, "delivery worker stopped gracefully");
                }

                result
            });

            self.handles.push(Supervised { name: format!("worker-{worker_id}"), handle });
        }

        info!(spawned_workers = self.worker_count, "all delivery workers spawned successfully");
    }

    /// Spawns a background task that is joined on shutdown.
    ///
    /// The closure receives a child of the pool's cancellation token.
    pub fn spawn_background<F, Fut>(&mut self, name: &str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let future = task(self.cancellation_token.child_token());
        let handle = tokio::spawn(async move {
            future.await;
            Ok(())
        });
        info!(task = name, "background task spawned");
        self.handles.push(Supervised { name: name.to_string(), handle });
    }

    /// Gracefully shutdown all workers, waiting for in-flight deliveries to
    /// complete.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the tasks do not finish within `timeout`,
    /// or `WorkerPanic` for the first task that panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            task_count = self.handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.handles);
        let stats = self.ctx.stats.clone();
        let shutdown_future = async move {
            let mut first_panic = None;

            for (index, supervised) in handles.into_iter().enumerate() {
                match supervised.handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(
                            task = %supervised.name,
                            error = %error,
                            "task completed with error during shutdown"
                        );
                    },
                    Err(join_error) => {
                        error!(
                            task = %supervised.name,
                            error = %join_error,
                            "task panicked during shutdown"
                        );
                        first_panic.get_or_insert(DeliveryError::WorkerPanic {
                            worker_id: index,
                            message: join_error.to_string(),
                        });
                    },
                }
            }

            stats.write().await.active_workers = 0;

            first_panic
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_timeout) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Check if any supervised task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.handles.iter().any(|s| !s.handle.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.handles.iter().filter(|s| !s.handle.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_tasks = active_count,
                "WorkerPool dropped with active tasks, forcing cancellation"
            );
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hookwire_core::{
        events::NoOpEventHandler,
        time::{Clock, RealClock},
    };
    use tokio::sync::RwLock;

    use super::*;
    use crate::{
        client::DeliveryClient,
        engine::{DeliveryConfig, EngineStats},
        hook::NoOpOutboundHook,
        queue::mock::InMemoryTaskQueue,
        scheduler::TaskScheduler,
        storage::mock::MockDeliveryStorage,
    };

    fn context(poll_interval: Duration) -> WorkerContext {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let storage = Arc::new(MockDeliveryStorage::new());
        let queue = Arc::new(InMemoryTaskQueue::new(clock.clone(), Duration::from_secs(65)));
        WorkerContext {
            scheduler: TaskScheduler::new(
                storage.clone(),
                queue.clone(),
                clock.clone(),
                Duration::from_secs(180),
            ),
            storage,
            queue,
            client: Arc::new(DeliveryClient::with_defaults().unwrap()),
            hook: Arc::new(NoOpOutboundHook),
            event_handler: Arc::new(NoOpEventHandler::new()),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            clock,
            config: DeliveryConfig { poll_interval, ..DeliveryConfig::default() },
        }
    }

    #[tokio::test]
    async fn spawns_and_shuts_down_workers() {
        let ctx = context(Duration::from_millis(20));
        let stats = ctx.stats.clone();
        let mut pool = WorkerPool::new(ctx, 4, CancellationToken::new());

        pool.spawn_workers().await;
        assert_eq!(pool.handles.len(), 4);
        assert_eq!(stats.read().await.active_workers, 4);
        assert!(pool.has_active_workers());

        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        pool.shutdown_graceful(Duration::from_secs(3)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(stats.read().await.active_workers, 0);
    }

    #[tokio::test]
    async fn background_tasks_observe_cancellation() {
        let mut pool =
            WorkerPool::new(context(Duration::from_secs(1)), 0, CancellationToken::new());
        pool.spawn_background("ticker", |token| async move { token.cancelled().await });

        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn stuck_task_times_out() {
        let mut pool =
            WorkerPool::new(context(Duration::from_secs(1)), 0, CancellationToken::new());
        pool.spawn_background("stuck", |_token| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let result = pool.shutdown_graceful(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(DeliveryError::ShutdownTimeout { .. })));
    }

    #[tokio::test]
    async fn panicking_task_is_reported() {
        let mut pool =
            WorkerPool::new(context(Duration::from_secs(1)), 0, CancellationToken::new());
        pool.spawn_background("faulty", |_token| async move { panic!("background task bug") });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = pool.shutdown_graceful(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DeliveryError::WorkerPanic { .. })));
    }

    #[tokio::test]
    async fn empty_pool_shuts_down_immediately() {
        let pool = WorkerPool::new(context(Duration::from_secs(1)), 0, CancellationToken::new());
        assert!(!pool.has_active_workers());
        pool.shutdown_graceful(Duration::from_millis(1)).await.unwrap();
    }
}
