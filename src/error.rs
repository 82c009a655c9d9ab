//! Crate-level error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;
use crate::naming::NamingError;
use crate::order::OrderError;
use crate::ports::PortSpecError;
use crate::runner::RunError;
use crate::wait::WaitError;

/// Result type for operations that can fail anywhere in the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration problems found while reading the environment or run files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read {path}: {reason}")]
    File { path: PathBuf, reason: String },
}

/// Top-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Port mapping error: {0}")]
    Ports(#[from] PortSpecError),

    #[error("Naming error: {0}")]
    Naming(#[from] NamingError),

    #[error("Start order error: {0}")]
    Order(#[from] OrderError),

    #[error("Readiness error: {0}")]
    Wait(#[from] WaitError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),
}
