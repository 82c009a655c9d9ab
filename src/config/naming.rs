use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;
use crate::naming::{DEFAULT_MAX_INDEX, DEFAULT_NAME_PATTERN};

/// Container naming defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingConfig {
    pub pattern: String,
    pub max_index: u64,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_NAME_PATTERN.to_string(),
            max_index: DEFAULT_MAX_INDEX,
        }
    }
}

impl NamingConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_index = parse_optional_env("DOCKHAND_MAX_NAME_INDEX", defaults.max_index)?;
        if max_index == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DOCKHAND_MAX_NAME_INDEX".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            pattern: optional_env("DOCKHAND_NAME_PATTERN")?.unwrap_or(defaults.pattern),
            max_index,
        })
    }
}
