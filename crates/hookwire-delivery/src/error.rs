//! Error types for dispatch and delivery operations.
//!
//! Transport failures (`NetworkError`, `Timeout`, `Denied`) are what the
//! worker records on failed attempts; everything else is an infrastructure
//! failure that leaves the task in the queue for reclaim.

use std::{fmt, time::Duration};

use hookwire_core::{models::ErrorCode, CoreError};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for dispatch and delivery operations.
///
/// `Clone` so a single registry load failure can be handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Timeout that was exceeded, in milliseconds
        timeout_ms: u64,
    },

    /// Destination rejected by the egress ACL.
    #[error("destination denied by egress policy: {host}")]
    Denied {
        /// Host (and resolved address when known) that was rejected
        host: String,
    },

    /// Work queue operation failed.
    #[error("queue error: {message}")]
    QueueError {
        /// Queue error message
        message: String,
    },

    /// Database operation failed.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Payload could not be encoded or decoded.
    #[error("serialization error: {message}")]
    SerializationError {
        /// Serialization error message
        message: String,
    },

    /// Outbound hook rejected the request.
    #[error("outbound hook failed: {message}")]
    HookError {
        /// Hook error message
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {message}")]
    WorkerPanic {
        /// Worker that panicked
        worker_id: usize,
        /// Panic message if one could be extracted
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates an ACL denial.
    pub fn denied(host: impl Into<String>) -> Self {
        Self::Denied { host: host.into() }
    }

    /// Creates a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::QueueError { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError { message: message.into() }
    }

    /// Creates a hook error.
    pub fn hook(message: impl Into<String>) -> Self {
        Self::HookError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Attempt error code for transport failures.
    ///
    /// Returns `None` for errors that are not the endpoint's fault; those
    /// leave the attempt untouched rather than failing it.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Timeout { .. } => Some(ErrorCode::Timeout),
            Self::Denied { .. } => Some(ErrorCode::Denied),
            Self::NetworkError { .. } => Some(ErrorCode::Unknown),
            _ => None,
        }
    }

    /// True for failures of the delivery itself rather than of the pipeline.
    pub fn is_delivery_failure(&self) -> bool {
        self.error_code().is_some()
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::database(err.to_string())
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<redis::RedisError> for DeliveryError {
    fn from(err: redis::RedisError) -> Self {
        Self::queue(err.to_string())
    }
}

/// Category of delivery error for logging and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues and timeouts.
    Network,
    /// Egress policy denials.
    Policy,
    /// Queue operations.
    Queue,
    /// Database operations.
    Database,
    /// Configuration or payload problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::Denied { .. } => Self::Policy,
            DeliveryError::QueueError { .. } => Self::Queue,
            DeliveryError::DatabaseError { .. } => Self::Database,
            DeliveryError::ConfigurationError { .. }
            | DeliveryError::SerializationError { .. }
            | DeliveryError::HookError { .. } => Self::Configuration,
            DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Policy => write!(f, "policy"),
            Self::Queue => write!(f, "queue"),
            Self::Database => write!(f, "database"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
