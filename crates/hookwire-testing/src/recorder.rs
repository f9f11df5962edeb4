//! Event handler that keeps every attempt event for later assertions.

use async_trait::async_trait;
use hookwire_core::events::{AttemptEvent, EventHandler};
use tokio::sync::Mutex;

/// Collects published attempt events in order.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<AttemptEvent>>,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events seen so far.
    pub async fn events(&self) -> Vec<AttemptEvent> {
        self.events.lock().await.clone()
    }

    /// Number of succeeded events.
    pub async fn succeeded(&self) -> usize {
        self.count(|e| matches!(e, AttemptEvent::Succeeded(_))).await
    }

    /// Number of failed events.
    pub async fn failed(&self) -> usize {
        self.count(|e| matches!(e, AttemptEvent::Failed(_))).await
    }

    /// Number of canceled events.
    pub async fn canceled(&self) -> usize {
        self.count(|e| matches!(e, AttemptEvent::Canceled(_))).await
    }

    async fn count(&self, predicate: impl Fn(&AttemptEvent) -> bool) -> usize {
        self.events.lock().await.iter().filter(|e| predicate(e)).count()
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: AttemptEvent) {
        self.events.lock().await.push(event);
    }
}
