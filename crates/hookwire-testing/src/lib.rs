//! Test infrastructure for hookwire.
//!
//! Provides fixture builders, proptest strategies, an event recorder and a
//! `TestEnv` that runs the real delivery engine over in-memory storage, an
//! in-memory queue, a deterministic clock and a mock HTTP server.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod env;
pub mod fixtures;
pub mod recorder;
pub mod strategies;

pub use env::{TestEnv, TestEnvBuilder};
pub use fixtures::{EndpointBuilder, EventBuilder};
pub use hookwire_core::time::TestClock;
pub use recorder::RecordingEventHandler;
