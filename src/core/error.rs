//! Error types for pool, process, and protocol operations.

use thiserror::Error;

use crate::core::protocol::TaskId;

/// Errors produced by process handles, workers, and pools.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The worker program could not be spawned.
    #[error("process start failed: {0}")]
    ProcessStart(String),
    /// `start` was called on a process that was already started.
    #[error("process already started")]
    AlreadyStarted,
    /// The operation needs a started process.
    #[error("process not started")]
    NotStarted,
    /// A join deadline passed; the process is still running.
    #[error("operation timed out")]
    Timeout,
    /// The task raised an error inside the child process.
    #[error("remote execution failed: {kind}: {message}")]
    RemoteExecution {
        /// Error kind reported by the child.
        kind: String,
        /// Human-readable description.
        message: String,
    },
    /// A child sent something the coordinator cannot match or parse.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The worker running this job exited before reporting its result.
    #[error("worker lost before task {task_id} completed")]
    WorkerLost {
        /// Job that was lost.
        task_id: TaskId,
    },
    /// The pool was closed before the job completed.
    #[error("pool has been closed")]
    PoolClosed,
    /// Nothing is queued on the channel right now.
    #[error("channel empty")]
    ChannelEmpty,
    /// The other side of the channel is gone.
    #[error("channel closed")]
    ChannelClosed,
    /// A value could not be converted to or from JSON.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Pipe or process I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Internal failure (background task panic, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

impl PoolError {
    /// Whether the error came from the task itself rather than the pool machinery.
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteExecution { .. })
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_execution_display() {
        let err = PoolError::RemoteExecution {
            kind: "ValueError".into(),
            message: "bad input".into(),
        };
        assert_eq!(err.to_string(), "remote execution failed: ValueError: bad input");
        assert!(err.is_remote());
    }

    #[test]
    fn test_worker_lost_display() {
        let err = PoolError::WorkerLost { task_id: 7 };
        assert_eq!(err.to_string(), "worker lost before task 7 completed");
        assert!(!err.is_remote());
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: PoolError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, PoolError::Serialization(_)));
    }
}
