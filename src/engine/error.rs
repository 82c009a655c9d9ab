//! Error types for Docker Engine access.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::image_name::ImageNameError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while talking to the Docker Engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine answered with a status code the caller did not accept.
    #[error("Engine returned HTTP {status} for {method} {url}: {body}")]
    Status {
        /// HTTP method of the failed request.
        method: String,
        /// Full request URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body as returned by the engine.
        body: String,
    },

    /// The engine could not be reached or the connection broke.
    #[error("Transport error talking to engine at {url}: {reason}")]
    Transport {
        /// Full request URL.
        url: String,
        /// Underlying I/O or HTTP client failure.
        reason: String,
    },

    /// Client certificate material could not be loaded.
    #[error("Invalid TLS material in {}: {reason}", .path.display())]
    Tls {
        /// File that failed to load.
        path: PathBuf,
        /// Reason for failure.
        reason: String,
    },

    /// A streaming operation reported error events.
    #[error("Engine reported {count} error(s) during {operation}: {message}")]
    Stream {
        /// Operation name, e.g. "pull of 'app:1.0'".
        operation: String,
        /// First error message observed.
        message: String,
        /// Number of error events observed.
        count: usize,
    },

    /// A response body could not be decoded.
    #[error("Unexpected engine response for {url}: {reason}")]
    Decode {
        /// Full request URL.
        url: String,
        /// Reason for failure.
        reason: String,
    },

    /// The endpoint URL is unusable.
    #[error("Invalid engine endpoint '{url}': {reason}")]
    Endpoint {
        /// The configured URL.
        url: String,
        /// Reason for rejection.
        reason: String,
    },

    /// Image reference could not be parsed.
    #[error(transparent)]
    ImageName(#[from] ImageNameError),

    /// Push succeeded but the temporary registry tag stayed behind.
    #[error("Image '{image}' was pushed, but the temporary tag could not be removed")]
    TemporaryTag {
        /// The fully qualified temporary tag.
        image: String,
    },

    /// I/O error (reading build contexts, certificates).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            EngineError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the engine answered 404.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub(crate) fn transport(url: &str, err: impl std::fmt::Display) -> Self {
        EngineError::Transport {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn decode(url: &str, err: impl std::fmt::Display) -> Self {
        EngineError::Decode {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}
