//! dockhand: run Docker containers for builds and tests over the Engine API.
//!
//! The pieces can be used on their own or together through [`runner::Runner`]:
//!
//! - [`engine`]: HTTP(S) client for the Docker Engine, including streamed
//!   pull/push/build progress and container logs.
//! - [`ports`]: port mapping specs and the table of engine-assigned ports.
//! - [`naming`]: container names from placeholder patterns.
//! - [`wait`]: readiness polling (HTTP, TCP, log pattern, health, exec, exit).
//! - [`order`]: dependency ordering of container specs.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod naming;
pub mod order;
pub mod ports;
pub mod runner;
pub mod wait;

pub use config::Config;
pub use error::{ConfigError, Error, Result};
