//! Error types for job scheduling operations.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Programmer misuse of a scheduling primitive. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    /// The task has no permit group but tried to acquire or compete.
    #[error("task `{0}` has no permit group assigned")]
    NoPermitGroup(String),
    /// The task declares a different permit group than the one it called into.
    #[error("task `{task}` is not a member of permit group `{group}`")]
    ForeignPermitGroup {
        /// Task name.
        task: String,
        /// Name of the semaphore that rejected the call.
        group: String,
    },
    /// Release was called by a task that does not own a permit.
    #[error("task `{task}` does not own a permit of `{group}`")]
    NotOwner {
        /// Task name.
        task: String,
        /// Semaphore name.
        group: String,
    },
    /// The task is already queued for or holding a permit.
    #[error("task `{0}` is already competing for a permit")]
    AlreadyCompeting(String),
    /// Capacity change attempted on a sealed semaphore.
    #[error("permit group `{0}` is sealed")]
    Sealed(String),
}

/// Errors produced by the job manager and its primitives.
///
/// The type is `Clone` so that every caller awaiting the same future receives
/// the same failure.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Misuse of an API; fatal to the call.
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),
    /// A blocking wait elapsed before its condition was met.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The waiting thread was woken by a hard cancellation.
    #[error("thread interrupted")]
    Interrupted,
    /// The task was cancelled before producing a result.
    #[error("task cancelled")]
    Cancelled,
    /// The task body failed or panicked.
    #[error("task failed: {0}")]
    TaskFailed(Arc<anyhow::Error>),
    /// The worker pool no longer accepts work.
    #[error("worker pool has been shut down")]
    PoolShutdown,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Internal failure (thread spawn, join error, ...).
    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Wrap a task-body failure.
    pub fn task_failed(err: anyhow::Error) -> Self {
        Self::TaskFailed(Arc::new(err))
    }

    /// Whether this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Whether this error reports an interruption caused by hard cancellation.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Whether this error reports API misuse.
    #[must_use]
    pub const fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }
}

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
