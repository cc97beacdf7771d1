use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A convenience `Result` alias using [`FanoutError`].
pub type FanoutResult<T> = Result<T, FanoutError>;

/// Top-level error type for the orchestrator.
///
/// Only batch-level failures travel through this type. A single worker's
/// failure is data, recorded as a [`WorkerError`] inside its final result.
#[derive(Error, Debug)]
pub enum FanoutError {
    /// The request was rejected before any worker was created.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The execution substrate cannot accept new work.
    #[error("Execution substrate unavailable: {0}")]
    SubstrateUnavailable(String),

    /// A single worker failed to start.
    #[error("Spawn error for worker {worker_index}: {message}")]
    Spawn {
        /// Index of the worker that failed to start.
        worker_index: usize,
        /// Reason reported by the substrate.
        message: String,
    },

    /// A started worker failed during execution.
    #[error("Worker {worker_index} failed: {message}")]
    WorkerRuntime {
        /// Index of the failing worker.
        worker_index: usize,
        /// Reason reported by the worker.
        message: String,
    },

    /// A per-worker or per-session deadline elapsed.
    #[error("Timed out after {after_ms}ms")]
    TimedOut {
        /// The deadline that elapsed, in milliseconds.
        after_ms: u64,
    },

    /// The session was cancelled by the caller.
    #[error("Session cancelled")]
    Cancelled,

    /// No session with the given id is known (never existed or already reclaimed).
    #[error("Session not found: {0}")]
    SessionNotFound(uuid::Uuid),

    /// An invalid session operation.
    #[error("Session error: {0}")]
    Session(String),

    /// Configuration parsing or validation failed.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why one worker did not succeed.
///
/// Recorded in the worker's final result; never escalated to sibling workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerError {
    /// The substrate could not create the execution.
    Spawn {
        /// Reason reported by the substrate.
        message: String,
    },
    /// The execution started but failed.
    Runtime {
        /// Reason reported by the execution.
        message: String,
    },
    /// The per-worker or per-session deadline elapsed; the execution was force-terminated.
    TimedOut {
        /// The deadline that elapsed, in milliseconds.
        after_ms: u64,
    },
    /// The session was cancelled while this worker was still running.
    Cancelled,
}

impl WorkerError {
    /// Shorthand for [`WorkerError::Spawn`].
    pub fn spawn(message: impl Into<String>) -> Self {
        Self::Spawn {
            message: message.into(),
        }
    }

    /// Shorthand for [`WorkerError::Runtime`].
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Lift into the batch-level error type for the given worker.
    pub fn into_fanout(self, worker_index: usize) -> FanoutError {
        match self {
            Self::Spawn { message } => FanoutError::Spawn {
                worker_index,
                message,
            },
            Self::Runtime { message } => FanoutError::WorkerRuntime {
                worker_index,
                message,
            },
            Self::TimedOut { after_ms } => FanoutError::TimedOut { after_ms },
            Self::Cancelled => FanoutError::Cancelled,
        }
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { message } => write!(f, "spawn failed: {message}"),
            Self::Runtime { message } => write!(f, "{message}"),
            Self::TimedOut { after_ms } => write!(f, "timed out after {after_ms}ms"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
