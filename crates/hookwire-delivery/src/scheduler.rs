//! Hands persisted attempts to the work queue.
//!
//! Only attempts due within the pre-schedule window become tasks; the rest
//! stay `INIT` until the requeue sweep finds them inside the window. Queue
//! add happens before the `QUEUED` mark, so a crash in between leaves a task
//! whose row is still `INIT`; the sweep may then queue it again, which the
//! duplicate-safe outcome write absorbs.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hookwire_core::{
    models::{Attempt, AttemptId, EventId},
    time::Clock,
};
use tracing::{debug, warn};

use crate::{
    error::Result,
    queue::{Task, TaskPayload, TaskQueue},
    storage::DeliveryStorage,
};

/// Adds `window` to `at`, saturating at the chrono maximum.
pub(crate) fn window_end(at: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| at.checked_add_signed(window))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Subtracts `window` from `at`, saturating at the chrono minimum.
pub(crate) fn window_start(at: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| at.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Turns attempts into queue tasks and marks them `QUEUED`.
#[derive(Clone)]
pub struct TaskScheduler {
    storage: Arc<dyn DeliveryStorage>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl TaskScheduler {
    /// Creates a scheduler queueing attempts due within `window`.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        window: Duration,
    ) -> Self {
        Self { storage, queue, clock, window }
    }

    /// Pre-schedule window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Schedules attempts whose event data is in `events`.
    ///
    /// Returns how many tasks were added. Attempts due after the window, or
    /// whose event is missing from `events`, are left untouched.
    ///
    /// # Errors
    ///
    /// Returns the queue error if adding fails, or the storage error if the
    /// `QUEUED` mark fails after the tasks were added.
    pub async fn schedule(
        &self,
        attempts: &[Attempt],
        events: &HashMap<EventId, serde_json::Value>,
    ) -> Result<usize> {
        let cutoff = window_end(self.clock.now_utc(), self.window);

        let mut tasks = Vec::new();
        for attempt in attempts.iter().filter(|a| a.scheduled_at <= cutoff) {
            let Some(event) = events.get(&attempt.event_id) else {
                warn!(
                    attempt_id = %attempt.id,
                    event_id = %attempt.event_id,
                    "event data missing, leaving attempt for requeue"
                );
                continue;
            };
            tasks.push(Task {
                id: attempt.id,
                scheduled_at: attempt.scheduled_at,
                payload: TaskPayload {
                    event_id: attempt.event_id,
                    endpoint_id: attempt.endpoint_id,
                    attempt_number: attempt.attempt_number,
                    event: event.clone(),
                },
            });
        }

        if tasks.is_empty() {
            return Ok(0);
        }

        let ids: Vec<AttemptId> = tasks.iter().map(|t| t.id).collect();
        let count = ids.len();
        self.queue.add(tasks).await?;
        self.storage.mark_queued(ids).await?;

        debug!(count, "scheduled attempts");
        Ok(count)
    }

    /// Schedules attempts after loading their events from the store.
    ///
    /// # Errors
    ///
    /// Returns storage or queue errors.
    pub async fn schedule_from_store(&self, attempts: &[Attempt]) -> Result<usize> {
        let mut event_ids: Vec<EventId> = attempts.iter().map(|a| a.event_id).collect();
        event_ids.sort_unstable();
        event_ids.dedup();

        let events: HashMap<EventId, serde_json::Value> = self
            .storage
            .find_events(event_ids)
            .await?
            .into_iter()
            .map(|event| (event.id, event.data))
            .collect();

        self.schedule(attempts, &events).await
    }
}
