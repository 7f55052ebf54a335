//! Error types.
//!
//! Only lifecycle failures reach callers of the supervisor. Storage errors stay
//! inside a worker step: they are logged and the cycle is retried later.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a queue repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid table name: {0:?}")]
    InvalidTable(String),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Failure of a task-source start or shutdown hook.
#[derive(Debug, Error)]
pub enum WorkError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("{0}")]
    Other(String),
}

/// Lifecycle errors returned by [`crate::app::Supervisor`].
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worker {name} is already running")]
    AlreadyRunning { name: String },

    #[error("worker start hook failed: {0}")]
    Startup(#[source] WorkError),

    #[error("worker shutdown hook failed: {0}")]
    Teardown(#[source] WorkError),

    #[error("shutdown cancelled before the worker acknowledged")]
    ShutdownCancelled,

    #[error("worker did not acknowledge shutdown within {0:?}")]
    ShutdownTimeout(Duration),
}
