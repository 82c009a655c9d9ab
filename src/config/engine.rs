use std::path::PathBuf;
use std::time::Duration;

use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env};
use crate::engine::{ClientOptions, DEFAULT_MAX_CONNECTIONS, EngineEndpoint, EngineError, TlsMaterial};
use crate::error::ConfigError;

/// Engine address used when `DOCKER_HOST` is not set.
pub const DEFAULT_DOCKER_HOST: &str = "tcp://127.0.0.1:2375";

/// How to reach the Docker engine.
///
/// Follows the docker CLI conventions: `DOCKER_HOST`, `DOCKER_CERT_PATH`,
/// `DOCKER_TLS_VERIFY` and `DOCKER_API_VERSION`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub docker_host: String,
    /// Directory holding `key.pem`, `cert.pem` and `ca.pem`.
    pub cert_path: Option<PathBuf>,
    pub tls_verify: bool,
    /// Pinned API version. Negotiated with the engine when unset.
    pub api_version: Option<String>,
    pub max_connections: usize,
    pub request_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            docker_host: DEFAULT_DOCKER_HOST.to_string(),
            cert_path: None,
            tls_verify: false,
            api_version: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            request_timeout: None,
        }
    }
}

impl EngineConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let tls_verify = parse_bool_env("DOCKER_TLS_VERIFY", defaults.tls_verify)?;

        // With TLS verification on and no explicit path, docker looks in ~/.docker.
        let cert_path = optional_env("DOCKER_CERT_PATH")?.map(PathBuf::from).or_else(|| {
            tls_verify
                .then(|| optional_env("HOME").ok().flatten())
                .flatten()
                .map(|home| PathBuf::from(home).join(".docker"))
        });

        let max_connections =
            parse_optional_env("DOCKHAND_MAX_CONNECTIONS", defaults.max_connections)?;
        if max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DOCKHAND_MAX_CONNECTIONS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            docker_host: optional_env("DOCKER_HOST")?.unwrap_or(defaults.docker_host),
            cert_path,
            tls_verify,
            api_version: optional_env("DOCKER_API_VERSION")?,
            max_connections,
            request_timeout: optional_env("DOCKHAND_REQUEST_TIMEOUT_SECS")?
                .map(|s| {
                    s.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                        key: "DOCKHAND_REQUEST_TIMEOUT_SECS".to_string(),
                        message: e.to_string(),
                    })
                })
                .transpose()?
                .map(Duration::from_secs),
        })
    }

    pub fn tls(&self) -> Option<TlsMaterial> {
        self.cert_path.as_ref().map(|path| TlsMaterial {
            cert_path: path.clone(),
            verify: self.tls_verify,
        })
    }

    pub fn endpoint(&self) -> Result<EngineEndpoint, EngineError> {
        let endpoint = EngineEndpoint::from_docker_host(&self.docker_host, self.tls())?;
        Ok(match &self.api_version {
            Some(version) => endpoint.with_api_version(version.as_str()),
            None => endpoint,
        })
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            max_connections: self.max_connections,
            request_timeout: self.request_timeout,
        }
    }
}
