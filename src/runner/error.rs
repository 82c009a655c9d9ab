//! Error types for the start sequence.

use thiserror::Error;

use crate::engine::EngineError;
use crate::naming::NamingError;
use crate::order::OrderError;
use crate::ports::PortSpecError;
use crate::wait::WaitError;

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunError>;

/// Errors that abort a start sequence.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Ports(#[from] PortSpecError),

    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error(transparent)]
    Order(#[from] OrderError),

    /// A readiness check could not be built from the plan.
    #[error("Invalid wait configuration for '{container}': {reason}")]
    InvalidWait { container: String, reason: String },

    /// The container did not become ready.
    #[error("Container '{container}' did not become ready: {source}")]
    NotReady {
        container: String,
        #[source]
        source: WaitError,
    },

    /// The engine lost track of a container right after starting it.
    #[error("Container '{container}' disappeared after start")]
    Vanished { container: String },

    #[error("Start sequence cancelled")]
    Cancelled,
}
