//! Error types for readiness waits.

use std::time::Duration;

use thiserror::Error;

use crate::engine::EngineError;

/// Result type for readiness waits.
pub type Result<T> = std::result::Result<T, WaitError>;

/// Errors that end a readiness wait.
#[derive(Debug, Error)]
pub enum WaitError {
    /// Not all checks passed within the wait budget.
    #[error("Timed out after {elapsed_millis} ms waiting for {pending}")]
    Timeout {
        /// Time spent waiting.
        elapsed_millis: u64,
        /// Labels of the checks that never passed.
        pending: String,
    },

    /// The wait was cancelled from outside.
    #[error("Wait cancelled after {elapsed_millis} ms")]
    Cancelled { elapsed_millis: u64 },

    /// The container stopped while it was expected to become ready.
    #[error("Container {container} stopped while waiting{}", .exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    NotRunning {
        container: String,
        exit_code: Option<i64>,
    },

    /// A check hit a condition that can never become ready.
    #[error("Readiness check {check} failed: {reason}")]
    CheckFailed { check: String, reason: String },

    /// A check was configured with unusable values.
    #[error("Invalid readiness check: {reason}")]
    InvalidCheck { reason: String },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl WaitError {
    pub(crate) fn timeout(elapsed: Duration, pending: String) -> Self {
        WaitError::Timeout {
            elapsed_millis: millis(elapsed),
            pending,
        }
    }

    pub(crate) fn cancelled(elapsed: Duration) -> Self {
        WaitError::Cancelled {
            elapsed_millis: millis(elapsed),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitError::Timeout { .. })
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
