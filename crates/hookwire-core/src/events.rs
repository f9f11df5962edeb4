//! Attempt lifecycle events for decoupled integrations.
//!
//! The delivery worker publishes one event per finished attempt. Handlers
//! subscribe through `EventHandler`; `MulticastEventHandler` fans events out
//! to several subscribers without the worker knowing about any of them.
//!
//! ```text
//!                  AttemptSucceeded/Failed/Canceled
//! ┌─────────────────┐                       ┌────────────────────┐
//! │ DeliveryWorker  │ ─────────────────────▶│ MulticastHandler   │
//! └─────────────────┘                       └────────────────────┘
//!                                                     │
//!                                                     ▼
//!                                             subscribers (audit,
//!                                             alerting, counters)
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AttemptId, EndpointId, ErrorCode, EventId, WorkspaceId};

/// Events emitted by the delivery worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AttemptEvent {
    /// Endpoint answered with a 2xx.
    Succeeded(AttemptSucceededEvent),

    /// Delivery failed; `exhausted` tells whether a retry follows.
    Failed(AttemptFailedEvent),

    /// Attempt was canceled without contacting the endpoint.
    Canceled(AttemptCanceledEvent),
}

impl AttemptEvent {
    /// Attempt the event refers to.
    pub fn attempt_id(&self) -> AttemptId {
        match self {
            Self::Succeeded(e) => e.attempt_id,
            Self::Failed(e) => e.attempt_id,
            Self::Canceled(e) => e.attempt_id,
        }
    }
}

/// Event emitted when a delivery succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptSucceededEvent {
    /// Attempt that succeeded.
    pub attempt_id: AttemptId,

    /// Event that was delivered.
    pub event_id: EventId,

    /// Endpoint that received it.
    pub endpoint_id: EndpointId,

    /// Owning workspace.
    pub workspace_id: WorkspaceId,

    /// URL of the endpoint.
    pub endpoint_url: String,

    /// HTTP status code returned by the endpoint.
    pub response_status: u16,

    /// 1-based attempt number.
    pub attempt_number: u32,

    /// Request latency in milliseconds.
    pub latency_ms: u64,

    /// When the delivery completed.
    pub delivered_at: DateTime<Utc>,
}

/// Event emitted when a delivery fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptFailedEvent {
    /// Attempt that failed.
    pub attempt_id: AttemptId,

    /// Event that failed to deliver.
    pub event_id: EventId,

    /// Endpoint that was targeted.
    pub endpoint_id: EndpointId,

    /// Owning workspace.
    pub workspace_id: WorkspaceId,

    /// URL of the endpoint.
    pub endpoint_url: String,

    /// HTTP status code if the endpoint responded.
    pub response_status: Option<u16>,

    /// Transport classification, absent for plain non-2xx answers.
    pub error_code: Option<ErrorCode>,

    /// 1-based attempt number.
    pub attempt_number: u32,

    /// True when no further attempt will be made.
    pub exhausted: bool,

    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,

    /// Human-readable error description.
    pub error_message: String,
}

/// Event emitted when an attempt is canceled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptCanceledEvent {
    /// Attempt that was canceled.
    pub attempt_id: AttemptId,

    /// Event the attempt belonged to.
    pub event_id: EventId,

    /// Endpoint the attempt targeted.
    pub endpoint_id: EndpointId,

    /// Reason, always `EndpointDisabled` today.
    pub error_code: ErrorCode,

    /// When the cancellation was recorded.
    pub canceled_at: DateTime<Utc>,
}

/// Trait for handling attempt events.
///
/// Handlers must not block delivery processing. Failures are the handler's
/// to log; nothing is propagated back to the worker.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles an attempt event.
    async fn handle_event(&self, event: AttemptEvent);
}

/// No-op event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: AttemptEvent) {}
}

/// Event handler that forwards every event to all subscribers concurrently.
#[derive(Debug, Clone)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a new multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber to receive attempt events.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for MulticastEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: AttemptEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}
