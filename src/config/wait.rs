use std::time::Duration;

use crate::config::helpers::parse_optional_env;
use crate::error::ConfigError;
use crate::wait::{DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT};

/// Defaults for readiness waits that a run file does not override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl WaitConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let interval_ms = parse_optional_env(
            "DOCKHAND_WAIT_INTERVAL_MS",
            millis(defaults.interval),
        )?;
        if interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DOCKHAND_WAIT_INTERVAL_MS".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        let timeout_ms = parse_optional_env("DOCKHAND_WAIT_TIMEOUT_MS", millis(defaults.timeout))?;
        Ok(Self {
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
        })
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
