//! Webhook dispatch and delivery with at-least-once guarantees.
//!
//! Events enter through the [`Dispatcher`], which fans each event out to
//! the subscribed endpoints of its workspace and persists the event with
//! one attempt per endpoint in a single transaction. Attempts due soon are
//! handed to a visibility-timeout work queue; delivery workers claim tasks,
//! send the webhook through an ACL-gated HTTP client and record the outcome
//! together with the next retry.
//!
//! # Delivery lifecycle
//!
//! 1. **Dispatch** - fanout, dedup on `unique_id`, transactional insert
//! 2. **Schedule** - attempts inside the pre-schedule window become tasks
//! 3. **Claim** - a Lua script re-scores claimed tasks to hide them
//! 4. **Deliver** - outbound hook, ACL check, HTTP request
//! 5. **Record** - outcome, detail and successor commit atomically
//!
//! A task whose processing errors is not deleted; once its visibility
//! timeout passes another claim picks it up. Duplicate processing is
//! absorbed by the outcome write, which only applies to non-terminal
//! attempts.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookwire_core::{events::NoOpEventHandler, time::RealClock, Event, WorkspaceId};
//! use hookwire_delivery::{
//!     hook::NoOpOutboundHook,
//!     queue::{QueueConfig, RedisTaskQueue},
//!     storage::PostgresDeliveryStorage,
//!     DeliveryConfig, DeliveryEngine, DeliveryError,
//! };
//!
//! # async fn example(
//! #     storage: PostgresDeliveryStorage,
//! #     redis: redis::aio::ConnectionManager,
//! # ) -> Result<(), DeliveryError> {
//! let mut engine = DeliveryEngine::new(
//!     Arc::new(storage),
//!     Arc::new(RedisTaskQueue::new(redis, QueueConfig::default())),
//!     Arc::new(RealClock::new()),
//!     Arc::new(NoOpEventHandler::new()),
//!     Arc::new(NoOpOutboundHook),
//!     DeliveryConfig::default(),
//! )?;
//! engine.start().await?;
//!
//! let event = Event::new("order.created", serde_json::json!({"id": 1}));
//! engine.dispatcher().dispatch(WorkspaceId::new(), vec![event]).await?;
//! # Ok(())
//! # }
//! ```

pub mod acl;
pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod hook;
pub mod queue;
pub mod registry;
pub mod requeue;
pub mod scheduler;
pub mod storage;
pub mod worker;
pub mod worker_pool;

pub use acl::Acl;
pub use client::{ClientConfig, ClientTlsConfig, DeliveryClient, DeliveryRequest, DeliveryResponse};
pub use dispatcher::Dispatcher;
pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, Result};
pub use queue::{QueueConfig, QueueStats, Task, TaskPayload, TaskQueue};
pub use registry::{Registry, RegistryConfig};
pub use storage::DeliveryStorage;

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default number of tasks claimed per batch.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Default pre-schedule window in seconds.
pub const DEFAULT_PRE_SCHEDULE_WINDOW_SECONDS: u64 = 180;
