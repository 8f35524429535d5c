//! Error types for the rate limiter.
//!
//! Ordinary "not yet allowed" answers are not errors: [`check_rate_limit`] returns a
//! plain decision. Errors are reserved for caller mistakes, terminal request outcomes
//! and the places where a denial has to travel through a `Result`.
//!
//! [`check_rate_limit`]: crate::RateLimiter::check_rate_limit

use std::time::Duration;

use thiserror::Error;

use crate::types::DenyReason;

/// The main error type for all rate limiter operations.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// One of the admission gates denied the request.
    #[error("Rate limit exceeded ({reason}), retry after {retry_after:?}")]
    CapacityExceeded {
        /// The gate that denied the request
        reason: DenyReason,
        /// Suggested wait before retrying
        retry_after: Duration,
    },

    /// The circuit breaker is open.
    #[error("Circuit breaker open, retry after {retry_after:?}")]
    CircuitOpen {
        /// Time until the breaker allows a probe request
        retry_after: Duration,
    },

    /// The request queue is at capacity.
    #[error("Request queue full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity
        capacity: usize,
    },

    /// A request with the same ID is already queued or being processed.
    #[error("Duplicate request ID: {0}")]
    DuplicateRequestId(String),

    /// No queued or in-flight request has this ID.
    #[error("Unknown request ID: {0}")]
    UnknownRequest(String),

    /// The request expired before it could be scheduled.
    #[error("Request expired: {0}")]
    RequestExpired(String),

    /// The request was cancelled before it was admitted.
    #[error("Request cancelled: {0}")]
    RequestCancelled(String),

    /// A queue operation was attempted on a limiter built without a queue.
    #[error("Request queue is not enabled")]
    QueueDisabled,

    /// The limiter is shutting down.
    #[error("Rate limiter is shutting down")]
    Shutdown,

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem error while persisting state
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RateLimitError {
    /// Build the error matching a denied decision.
    pub(crate) fn denied(reason: DenyReason, retry_after: Duration) -> Self {
        match reason {
            DenyReason::CircuitOpen => Self::CircuitOpen { retry_after },
            reason => Self::CapacityExceeded {
                reason,
                retry_after,
            },
        }
    }

    /// Check if retrying the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::CircuitOpen { .. }
        )
    }

    /// Suggested wait before retrying, if the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CapacityExceeded { retry_after, .. } | Self::CircuitOpen { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }
}
