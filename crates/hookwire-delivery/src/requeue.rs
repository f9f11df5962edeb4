//! Periodic sweep that queues attempts still sitting in `INIT`.
//!
//! Attempts end up unqueued when they were scheduled beyond the pre-schedule
//! window, or when the process died between persisting and queueing them.
//! The grace period keeps the sweep away from rows whose creator is still
//! about to queue them.

use std::{sync::Arc, time::Duration};

use hookwire_core::time::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    scheduler::{window_end, window_start, TaskScheduler},
    storage::DeliveryStorage,
};

/// Requeue sweep settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequeueConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Rows listed per round.
    pub batch_size: usize,
    /// Minimum row age before the sweep touches it.
    pub grace: Duration,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 20,
            grace: Duration::from_secs(60),
        }
    }
}

/// Finds `INIT` attempts due within the window and schedules them.
#[derive(Clone)]
pub struct RequeueSweep {
    storage: Arc<dyn DeliveryStorage>,
    scheduler: TaskScheduler,
    clock: Arc<dyn Clock>,
    config: RequeueConfig,
}

impl RequeueSweep {
    /// Creates a sweep.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        scheduler: TaskScheduler,
        clock: Arc<dyn Clock>,
        config: RequeueConfig,
    ) -> Self {
        Self { storage, scheduler, clock, config }
    }

    /// Runs one sweep to completion and returns how many attempts were queued.
    ///
    /// Pages through the due rows in `(scheduled_at, id)` order until a batch
    /// comes back short. Rows that cannot be scheduled are stepped over and
    /// picked up again by the next sweep.
    ///
    /// # Errors
    ///
    /// Returns the first storage or queue error; rows already scheduled stay
    /// scheduled.
    pub async fn run_once(&self) -> Result<usize> {
        let batch_size = self.config.batch_size.max(1);
        let mut total = 0;
        let mut after = None;

        loop {
            let now = self.clock.now_utc();
            let created_before = window_start(now, self.config.grace);
            let scheduled_before = window_end(now, self.scheduler.window());

            let attempts = self
                .storage
                .list_unqueued(created_before, scheduled_before, after, batch_size)
                .await?;
            let Some(last) = attempts.last() else {
                break;
            };
            after = Some((last.scheduled_at, last.id));
            let listed = attempts.len();

            let scheduled = self.scheduler.schedule_from_store(&attempts).await?;
            total += scheduled;
            debug!(listed, scheduled, "requeue batch");
            if scheduled < listed {
                warn!(skipped = listed - scheduled, "requeue left attempts unscheduled");
            }

            if listed < batch_size {
                break;
            }
        }

        if total > 0 {
            info!(requeued = total, "requeued unqueued attempts");
        }
        Ok(total)
    }

    /// Runs `run_once` every `interval` until cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(interval_secs = self.config.interval.as_secs(), "requeue sweep starting");

        loop {
            tokio::select! {
                () = self.clock.sleep(self.config.interval) => {}
                () = cancellation_token.cancelled() => break,
            }

            if let Err(error) = self.run_once().await {
                warn!(error = %error, "requeue sweep failed");
            }
        }

        info!("requeue sweep stopped");
    }
}
