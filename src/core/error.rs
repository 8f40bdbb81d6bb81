//! Error types for daemon operations.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::task::TaskId;

/// Which execution ceiling a task hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// Overall wall-clock ceiling.
    WallClock,
    /// No progress event within the inactivity window.
    Inactivity,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WallClock => f.write_str("wall-clock"),
            Self::Inactivity => f.write_str("inactivity"),
        }
    }
}

/// Errors produced by daemon components.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// A recurring rule did not match the schedule grammar.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    /// Task fields failed validation (e.g. empty title).
    #[error("invalid task: {0}")]
    InvalidTask(String),
    /// Another caller claimed the task first.
    #[error("task {0} already claimed")]
    ClaimConflict(TaskId),
    /// A per-task ceiling was exceeded.
    #[error("{kind} timeout after {limit:?}")]
    ExecutionTimeout {
        /// Which ceiling fired.
        kind: TimeoutKind,
        /// Configured limit.
        limit: Duration,
    },
    /// The agent executor raised or returned an error.
    #[error("collaborator error: {0}")]
    Collaborator(String),
    /// The collaborator returned without any usable outcome.
    #[error("unreconciled: task {0} finished without reporting an outcome")]
    UnreconciledTask(TaskId),
    /// No task with that id.
    #[error("task {0} not found")]
    NotFound(TaskId),
    /// Recoverable store failure.
    #[error("store error: {0}")]
    Store(String),
    /// Store is unusable; the daemon should exit.
    #[error("store corrupt: {0}")]
    StoreCorrupt(String),
    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),
    /// The scheduler loop has stopped and accepts no more work.
    #[error("daemon is shutting down")]
    ShuttingDown,
}

impl DaemonError {
    /// Whether the error should stop the scheduler loop.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreCorrupt(_))
    }
}

impl From<rusqlite::Error> for DaemonError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase | ErrorCode::CannotOpen) => {
                Self::StoreCorrupt(err.to_string())
            }
            _ => Self::Store(err.to_string()),
        }
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_kind() {
        let err = DaemonError::ExecutionTimeout {
            kind: TimeoutKind::Inactivity,
            limit: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "inactivity timeout after 30s");
        assert!(!err.is_fatal());
    }

    #[test]
    fn corrupt_store_is_fatal() {
        assert!(DaemonError::StoreCorrupt("bad page".into()).is_fatal());
        assert!(!DaemonError::Store("busy".into()).is_fatal());
    }
}
