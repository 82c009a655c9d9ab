//! Configuration read from the environment.
//!
//! Every value can also come from a `.env` file, which the binary loads
//! with `dotenvy` before calling [`Config::from_env`].

mod engine;
mod helpers;
mod naming;
mod wait;

pub use engine::{DEFAULT_DOCKER_HOST, EngineConfig};
pub use naming::NamingConfig;
pub use wait::WaitConfig;

use crate::error::ConfigError;

/// Everything the runner needs besides the run file itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub engine: EngineConfig,
    pub wait: WaitConfig,
    pub naming: NamingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            engine: EngineConfig::resolve()?,
            wait: WaitConfig::resolve()?,
            naming: NamingConfig::resolve()?,
        })
    }
}
