//! Docker Engine access over HTTP(S).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          EngineClient                            │
//! │                                                                  │
//! │  request() ──────────▶ status check ──▶ EngineResponse           │
//! │                                                                  │
//! │  stream_request() ───▶ EventStream                               │
//! │                          │                                       │
//! │                          ▼                                       │
//! │                   JsonStreamDecoder ──▶ StreamEvent              │
//! │                   (buffers partial     (progress/status/         │
//! │                    JSON across chunks)  stream/error)            │
//! │                                                                  │
//! │  follow_logs() ──────▶ LogHandle (background task + cancel)      │
//! │                          │                                       │
//! │                          ▼                                       │
//! │                     LogDecoder ──▶ LogLine ──▶ callback          │
//! └──────────────────────────────────────────────────────────────────┘
//!          │
//!          ▼  UrlBuilder: {base}/v{api}/{path}, identifiers encoded
//!     Docker Engine (tcp / TLS with key.pem, cert.pem, ca.pem)
//! ```

mod client;
mod endpoint;
mod error;
pub mod image_name;
pub mod logs;
pub mod model;
mod stream;
mod url;

pub use client::{ClientOptions, DEFAULT_MAX_CONNECTIONS, EngineClient, EngineResponse, RequestBody};
pub use endpoint::{EngineEndpoint, TlsMaterial};
pub use error::{EngineError, Result};
pub use image_name::{ImageName, ImageNameError};
pub use logs::{FollowOutcome, LogControl, LogHandle, LogLine, LogStream};
pub use model::{ContainerCreateRequest, ContainerDetails, ContainerSummary, RegistryAuth};
pub use stream::{EventStream, JsonStreamDecoder, ProgressLog, StreamEvent};
pub use url::{BuildOptions, UrlBuilder};
