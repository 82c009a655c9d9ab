//! Engine endpoint and TLS client identity.

use std::path::{Path, PathBuf};

use url::Url;

use crate::engine::error::{EngineError, Result};

/// Client certificate directory holding `key.pem`, `cert.pem` and `ca.pem`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    /// Verify the engine's certificate against `ca.pem`.
    pub verify: bool,
}

impl TlsMaterial {
    pub fn new(cert_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            verify: true,
        }
    }

    pub fn key_file(&self) -> PathBuf {
        self.cert_path.join("key.pem")
    }

    pub fn cert_file(&self) -> PathBuf {
        self.cert_path.join("cert.pem")
    }

    pub fn ca_file(&self) -> PathBuf {
        self.cert_path.join("ca.pem")
    }

    /// Load identity and CA into the client builder.
    pub(crate) fn apply(
        &self,
        builder: reqwest::ClientBuilder,
    ) -> Result<reqwest::ClientBuilder> {
        let mut identity_pem = read_pem(&self.cert_file())?;
        identity_pem.push(b'\n');
        identity_pem.extend(read_pem(&self.key_file())?);
        let identity = reqwest::Identity::from_pem(&identity_pem).map_err(|e| EngineError::Tls {
            path: self.key_file(),
            reason: e.to_string(),
        })?;

        let mut builder = builder.identity(identity).use_rustls_tls();

        let ca_file = self.ca_file();
        if ca_file.exists() {
            let ca_pem = read_pem(&ca_file)?;
            let certs =
                reqwest::Certificate::from_pem_bundle(&ca_pem).map_err(|e| EngineError::Tls {
                    path: ca_file.clone(),
                    reason: e.to_string(),
                })?;
            if certs.is_empty() {
                return Err(EngineError::Tls {
                    path: ca_file,
                    reason: "no certificates found".to_string(),
                });
            }
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        if !self.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(builder)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| EngineError::Tls {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Where the engine lives. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEndpoint {
    base_url: String,
    api_version: Option<String>,
    tls: Option<TlsMaterial>,
}

impl EngineEndpoint {
    /// Build from a `DOCKER_HOST` style address. `tcp://` maps to `http://`,
    /// or `https://` when TLS material is given.
    pub fn from_docker_host(host: &str, tls: Option<TlsMaterial>) -> Result<Self> {
        let invalid = |reason: &str| EngineError::Endpoint {
            url: host.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = host
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme (expected tcp://, http:// or https://)"))?;
        let scheme = match scheme {
            "tcp" | "http" if tls.is_some() => "https",
            "tcp" | "http" => "http",
            "https" => "https",
            "unix" | "npipe" => {
                return Err(invalid(
                    "local socket transports are not supported, use a tcp:// address",
                ));
            }
            _ => return Err(invalid("unsupported scheme")),
        };

        let parsed = Url::parse(&format!("{}://{}", scheme, rest)).map_err(|e| EngineError::Endpoint {
            url: host.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            api_version: None,
            tls,
        })
    }

    /// Pin the API version instead of negotiating it.
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        self.api_version = Some(version.trim_start_matches('v').to_string());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_version(&self) -> Option<&str> {
        self.api_version.as_deref()
    }

    pub fn tls(&self) -> Option<&TlsMaterial> {
        self.tls.as_ref()
    }

    /// Host part of the endpoint, used when the engine reports `0.0.0.0`.
    pub fn host(&self) -> String {
        Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }
}
