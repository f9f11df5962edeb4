//! Core domain models, time and persistence for hookwire.
//!
//! Provides strongly-typed identifiers, the event/endpoint/attempt model,
//! delivery lifecycle events, a clock abstraction, and the Postgres
//! repositories every other crate builds on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    AttemptCanceledEvent, AttemptEvent, AttemptFailedEvent, AttemptSucceededEvent, EventHandler,
    MulticastEventHandler, NoOpEventHandler,
};
pub use models::{
    Attempt, AttemptDetail, AttemptId, AttemptKey, AttemptRequest, AttemptResponse, AttemptResult,
    AttemptStatus, Endpoint, EndpointId, ErrorCode, Event, EventId, HttpMethod, RequestConfig,
    RetryConfig, RetryStrategy, TriggerMode, WorkspaceId,
};
pub use time::{Clock, RealClock, TestClock};
