//! Error types for upstream admission.

use std::time::Duration;

/// Errors produced while admitting, queueing, or dispatching a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// The wait queue is at capacity; the request was refused at arrival.
    #[error("wait queue is full: max queue length ({max_queue_length}) reached")]
    QueueFull {
        /// Maximum queue depth allowed.
        max_queue_length: usize,
    },
    /// The request waited longer than the queue timeout without a slot opening.
    #[error("request expired after waiting {waited:?} for an upstream slot")]
    QueueExpired {
        /// How long the request sat in the queue.
        waited: Duration,
    },
    /// No backend is eligible to serve the request.
    #[error("no live upstream backend available")]
    AllBackendsDown,
    /// The group task has shut down and no longer accepts commands.
    #[error("upstream group is closed")]
    GroupClosed,
}

impl UpstreamError {
    /// Suggested HTTP status for surfacing this error to a client.
    ///
    /// Queue-full and queue-timeout conditions map to 503, a dead upstream
    /// group to 502.
    pub fn status_code(&self) -> u16 {
        match self {
            UpstreamError::QueueFull { .. } | UpstreamError::QueueExpired { .. } => 503,
            UpstreamError::AllBackendsDown | UpstreamError::GroupClosed => 502,
        }
    }
}

/// Result type for admission operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;
