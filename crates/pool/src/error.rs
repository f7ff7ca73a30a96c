//! Error types for pool operations
use std::time::Duration;

use thiserror::Error;

use crate::scope::{RequestId, WorkerId};
use crate::state::LaunchDiscardReason;

/// Boxed error produced by collaborators (process engine, warmup, hooks, sessions).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorCategory {
    /// Transient; the caller may retry the acquisition.
    ServiceUnavailable,
    /// A leased worker misbehaved while serving a request.
    Processing,
    /// The pool or one of its collaborators was configured incorrectly.
    Configuration,
}

/// Errors surfaced by the process pool
#[derive(Error, Debug)]
pub enum Error {
    /// The pool finished draining and no longer grants leases
    #[error("Process pool has been terminated")]
    Terminated,

    /// `close()` was called; new acquisitions are refused
    #[error("Process pool is shutting down")]
    Closing,

    /// Non-blocking probe found no idle worker
    #[error("No workers available")]
    NoWorkers,

    /// The waiter queue reached its configured depth
    #[error("Worker queue is full (pending={pending}, capacity={capacity})")]
    QueueFull {
        /// Waiters already queued when the request was rejected
        pending: usize,
        /// Configured maximum queue depth
        capacity: usize,
    },

    /// The acquisition deadline elapsed before a worker was assigned
    #[error("Timed out waiting for a pooled worker after {waited:?}")]
    AcquireTimeout {
        /// Time spent inside the acquisition call
        waited: Duration,
    },

    /// The caller's [`Interrupt`](crate::Interrupt) fired while it was queued
    #[error("Interrupted while waiting for a worker")]
    Interrupted,

    /// The process engine could not start a session
    #[error("Failed to launch pooled worker {worker_id}")]
    LaunchFailed {
        /// Identifier reserved for the worker
        worker_id: WorkerId,
        /// Engine failure
        #[source]
        source: BoxError,
    },

    /// The warmup action rejected a freshly launched session
    #[error("Worker warmup failed for worker {worker_id}")]
    WarmupFailed {
        /// Identifier reserved for the worker
        worker_id: WorkerId,
        /// Warmup failure
        #[source]
        source: BoxError,
    },

    /// A worker launched successfully but the pool started shutting down meanwhile
    #[error("Worker {worker_id} was discarded after launch: {reason}")]
    LaunchDiscarded {
        /// Identifier of the discarded worker
        worker_id: WorkerId,
        /// Lifecycle state that caused the discard
        reason: LaunchDiscardReason,
    },

    /// A leased worker failed mid-request (for example, it overran its request deadline)
    #[error("Worker {worker_id} failed while serving request {request_id}: {message}")]
    Processing {
        /// Worker that failed
        worker_id: WorkerId,
        /// Request that was in flight
        request_id: RequestId,
        /// Failure description
        message: String,
    },

    /// Pool configuration is invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
        /// Underlying cause, if any
        #[source]
        source: Option<BoxError>,
    },
}

impl Error {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    /// Create a processing error for a worker that exceeded its request deadline
    pub(crate) fn request_timed_out(worker_id: WorkerId, request_id: RequestId) -> Self {
        Self::Processing {
            worker_id,
            request_id,
            message: format!("lease {request_id} exceeded request timeout"),
        }
    }

    /// Classify the error
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Processing { .. } => ErrorCategory::Processing,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Terminated
            | Self::Closing
            | Self::NoWorkers
            | Self::QueueFull { .. }
            | Self::AcquireTimeout { .. }
            | Self::Interrupted
            | Self::LaunchFailed { .. }
            | Self::WarmupFailed { .. }
            | Self::LaunchDiscarded { .. } => ErrorCategory::ServiceUnavailable,
        }
    }

    /// Check if this error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::ServiceUnavailable
    }

    /// Worker identifier associated with this error (if any)
    #[must_use]
    pub fn worker_id(&self) -> Option<WorkerId> {
        match self {
            Self::LaunchFailed { worker_id, .. }
            | Self::WarmupFailed { worker_id, .. }
            | Self::LaunchDiscarded { worker_id, .. }
            | Self::Processing { worker_id, .. } => Some(*worker_id),
            _ => None,
        }
    }
}
