//! Wire types for the Engine API.
//!
//! Requests are plain serde structs in the engine's PascalCase shape. There
//! is a single create-request type with one builder; responses are decoded
//! into the few fields this crate reads.

use std::collections::{BTreeMap, HashMap};

use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Body of `POST /containers/create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreateRequest {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, EmptyObject>,
    pub host_config: HostConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networking_config: Option<NetworkingConfig>,
}

/// Serializes as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes_from: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub auto_remove: bool,
}

/// A host side binding for one container port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    #[serde(default)]
    pub host_ip: String,
    /// Empty asks the engine to pick a port.
    #[serde(default)]
    pub host_port: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkingConfig {
    pub endpoints_config: BTreeMap<String, EndpointConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl ContainerCreateRequest {
    pub fn builder(image: impl Into<String>) -> ContainerCreateRequestBuilder {
        ContainerCreateRequestBuilder {
            request: ContainerCreateRequest {
                image: image.into(),
                ..Default::default()
            },
        }
    }
}

/// Builder for [`ContainerCreateRequest`].
#[derive(Debug, Clone)]
pub struct ContainerCreateRequestBuilder {
    request: ContainerCreateRequest,
}

impl ContainerCreateRequestBuilder {
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.request.hostname = Some(hostname.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.request.user = Some(user.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.request.env.push(format!("{}={}", key, value));
        self
    }

    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        self.request.cmd = Some(cmd);
        self
    }

    pub fn entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.request.entrypoint = Some(entrypoint);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.request.working_dir = Some(dir.into());
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.request
            .labels
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Expose and bind ports, keyed by `port/protocol`.
    pub fn ports(
        mut self,
        exposed: impl IntoIterator<Item = String>,
        bindings: BTreeMap<String, Vec<PortBinding>>,
    ) -> Self {
        for port in exposed {
            self.request.exposed_ports.insert(port, EmptyObject {});
        }
        self.request.host_config.port_bindings.extend(bindings);
        self
    }

    pub fn bind(mut self, bind: impl Into<String>) -> Self {
        self.request.host_config.binds.push(bind.into());
        self
    }

    pub fn link(mut self, link: impl Into<String>) -> Self {
        self.request.host_config.links.push(link.into());
        self
    }

    pub fn volumes_from(mut self, container: impl Into<String>) -> Self {
        self.request.host_config.volumes_from.push(container.into());
        self
    }

    pub fn auto_remove(mut self, auto_remove: bool) -> Self {
        self.request.host_config.auto_remove = auto_remove;
        self
    }

    /// Attach to a network. Aliases only apply to user-defined networks.
    pub fn network(mut self, mode: impl Into<String>, aliases: Vec<String>) -> Self {
        let mode = mode.into();
        if !aliases.is_empty() {
            let mut endpoints = BTreeMap::new();
            endpoints.insert(mode.clone(), EndpointConfig { aliases });
            self.request.networking_config = Some(NetworkingConfig {
                endpoints_config: endpoints,
            });
        }
        self.request.host_config.network_mode = Some(mode);
        self
    }

    pub fn build(self) -> ContainerCreateRequest {
        self.request
    }
}

/// Answer of `POST /containers/create`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateResponse {
    pub id: String,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

/// Answer of `GET /version`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionInfo {
    #[serde(default)]
    pub version: String,
    pub api_version: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
}

/// Entry of `GET /containers/json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub status: String,
}

impl ContainerSummary {
    /// Names without the engine's leading `/`.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|n| n.trim_start_matches('/'))
    }

    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Entry of `GET /images/json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
}

/// Answer of `GET /containers/{id}/json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDetails {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub exit_code: i64,
    #[serde(default)]
    pub health: Option<Health>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Health {
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub healthcheck: Option<serde_json::Value>,
    #[serde(default)]
    pub tty: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(default)]
    pub ports: HashMap<String, Option<Vec<PortBinding>>>,
    #[serde(default)]
    pub networks: HashMap<String, NetworkEndpoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkEndpoint {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

impl ContainerDetails {
    /// First 12 characters of the id.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// Name without the leading `/`.
    pub fn name(&self) -> &str {
        self.name.trim_start_matches('/')
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    /// Exit code, once the container is no longer running.
    pub fn exit_code(&self) -> Option<i64> {
        (!self.state.running).then_some(self.state.exit_code)
    }

    pub fn has_health_check(&self) -> bool {
        let Some(check) = &self.config.healthcheck else {
            return false;
        };
        // `["NONE"]` disables an inherited HEALTHCHECK.
        match check.get("Test").and_then(|t| t.as_array()) {
            Some(test) => test.first().and_then(|t| t.as_str()) != Some("NONE"),
            None => true,
        }
    }

    pub fn health_status(&self) -> Option<&str> {
        self.state.health.as_ref().map(|h| h.status.as_str())
    }

    /// IP on the default bridge, else the first network that has one.
    pub fn ip_address(&self) -> Option<&str> {
        if !self.network_settings.ip_address.is_empty() {
            return Some(&self.network_settings.ip_address);
        }
        let mut networks: Vec<_> = self.network_settings.networks.iter().collect();
        networks.sort_by(|a, b| a.0.cmp(b.0));
        networks
            .into_iter()
            .map(|(_, n)| n.ip_address.as_str())
            .find(|ip| !ip.is_empty())
    }

    /// Bound host ports keyed by `port/protocol`. Unbound ports are omitted.
    pub fn port_bindings(&self) -> BTreeMap<String, PortBinding> {
        self.network_settings
            .ports
            .iter()
            .filter_map(|(port, bindings)| {
                bindings
                    .as_ref()
                    .and_then(|b| b.first())
                    .map(|b| (port.clone(), b.clone()))
            })
            .collect()
    }
}

/// Body of `POST /containers/{id}/exec`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecConfig {
    pub cmd: Vec<String>,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

impl ExecConfig {
    pub fn new(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            attach_stdout: true,
            attach_stderr: true,
        }
    }
}

/// Answer of `GET /exec/{id}/json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecInspect {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub exit_code: Option<i64>,
}

/// Already resolved registry credentials, sent as `X-Registry-Auth`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serveraddress: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identitytoken: Option<String>,
}

impl RegistryAuth {
    pub fn basic(username: &str, password: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            ..Default::default()
        }
    }

    pub fn token(identity_token: &str) -> Self {
        Self {
            identitytoken: Some(identity_token.to_string()),
            ..Default::default()
        }
    }

    /// Padded, URL-safe base64 of the JSON form. An identity token replaces
    /// the user/password fields.
    pub fn to_header(&self) -> String {
        let payload = match &self.identitytoken {
            Some(token) => serde_json::json!({ "identitytoken": token }),
            None => serde_json::to_value(self).unwrap_or_default(),
        };
        base64::engine::general_purpose::URL_SAFE.encode(payload.to_string())
    }
}

/// First 12 characters of a container or image id.
pub fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    id.get(..12).unwrap_or(id)
}
