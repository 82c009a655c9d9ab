//! Port mapping resolution.
//!
//! A mapping string has the form `[bindIp:]hostPort:containerPort[/tcp|/udp]`.
//! The host port is either a number, empty (engine picks one), or a variable
//! name. Variables are bound to the engine-assigned port once the container
//! is running and can then be substituted as `${name}` in other values.
//!
//! The bind part may itself be a variable, written `+name` or `${name}`. It
//! is bound to the host IP the engine reports, with `0.0.0.0` standing for
//! the docker host.
//!
//! ```text
//!   "db.port:5432"  ──parse──▶  PortSpec { 5432/tcp, Variable("db.port") }
//!                                   │
//!          container started,       │  resolve({5432/tcp: 49153})
//!          engine assigned 49153    ▼
//!                              DynamicPortTable { db.port = 49153 }
//!                                   │
//!   "jdbc://localhost:${db.port}" ──substitute──▶ "jdbc://localhost:49153"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{LazyLock, RwLock};

use regex::Regex;
use thiserror::Error;

use crate::engine::model::{ContainerDetails, PortBinding};

/// Result type for port operations.
pub type Result<T> = std::result::Result<T, PortSpecError>;

/// Errors from parsing or resolving port mappings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortSpecError {
    #[error(
        "Invalid port mapping '{spec}': required format is '[<hostIP>:]<hostPort>:<containerPort>[/tcp|udp]'"
    )]
    MissingColon { spec: String },

    #[error("Invalid port mapping '{spec}': container port '{value}' is not a port number")]
    InvalidContainerPort { spec: String, value: String },

    #[error("Invalid port mapping '{spec}': host port '{value}' is not a port number")]
    InvalidHostPort { spec: String, value: String },

    #[error("Invalid port mapping '{spec}': host '{host}' to bind to cannot be resolved")]
    UnresolvableHost { spec: String, host: String },

    /// A variable may only ever be bound to one port.
    #[error("Port variable '{name}' is already bound to {bound}, refusing to rebind to {attempted}")]
    Rebind {
        name: String,
        bound: u16,
        attempted: u16,
    },

    #[error("Host IP variable '{name}' is already bound to {bound}, refusing to rebind to {attempted}")]
    HostRebind {
        name: String,
        bound: String,
        attempted: String,
    },

    #[error("Engine reported an unusable port binding '{value}' for {container_port}")]
    InvalidBinding {
        container_port: String,
        value: String,
    },

    #[error("Cannot write port properties to {}: {reason}", .path.display())]
    Write { path: PathBuf, reason: String },
}

static PROTOCOL_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?)(?:/(tcp|udp))?$").expect("static regex"));
static VARIABLE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A container port with its protocol, printed as the engine's `80/tcp` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerPort {
    pub port: u16,
    pub protocol: Protocol,
}

impl ContainerPort {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for ContainerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl FromStr for ContainerPort {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        let (port, protocol) = match s.split_once('/') {
            Some((port, "tcp")) => (port, Protocol::Tcp),
            Some((port, "udp")) => (port, Protocol::Udp),
            Some(_) => return Err(()),
            None => (s, Protocol::Tcp),
        };
        Ok(Self {
            port: port.parse().map_err(|_| ())?,
            protocol,
        })
    }
}

/// How the host side of a mapping is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostBinding {
    Fixed(u16),
    /// Engine-assigned, published under this variable name.
    Variable(String),
    /// Engine-assigned, not published.
    Unassigned,
}

/// One parsed port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub container: ContainerPort,
    pub host: HostBinding,
    pub bind_interface: Option<IpAddr>,
    /// Variable receiving the host IP the engine binds to.
    pub host_ip_variable: Option<String>,
}

/// Variable name to engine-assigned host port or host IP. A variable is
/// either absent or bound to one value for the rest of the run.
#[derive(Debug, Default)]
pub struct DynamicPortTable {
    ports: RwLock<BTreeMap<String, u16>>,
    hosts: RwLock<BTreeMap<String, String>>,
}

impl DynamicPortTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `port`. Binding the same value again is a no-op.
    pub fn bind(&self, name: &str, port: u16) -> Result<()> {
        let mut ports = self.ports.write().unwrap_or_else(|e| e.into_inner());
        match ports.get(name) {
            Some(bound) if *bound == port => Ok(()),
            Some(bound) => Err(PortSpecError::Rebind {
                name: name.to_string(),
                bound: *bound,
                attempted: port,
            }),
            None => {
                tracing::debug!("Port variable {} = {}", name, port);
                ports.insert(name.to_string(), port);
                Ok(())
            }
        }
    }

    /// Bind host IP variable `name` to `ip`.
    pub fn bind_host(&self, name: &str, ip: &str) -> Result<()> {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        match hosts.get(name) {
            Some(bound) if bound == ip => Ok(()),
            Some(bound) => Err(PortSpecError::HostRebind {
                name: name.to_string(),
                bound: bound.clone(),
                attempted: ip.to_string(),
            }),
            None => {
                tracing::debug!("Host IP variable {} = {}", name, ip);
                hosts.insert(name.to_string(), ip.to_string());
                Ok(())
            }
        }
    }

    pub fn get_host(&self, name: &str) -> Option<String> {
        self.hosts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn get(&self, name: &str) -> Option<u16> {
        self.ports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, u16> {
        self.ports.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn host_snapshot(&self) -> BTreeMap<String, String> {
        self.hosts.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.read().unwrap_or_else(|e| e.into_inner()).is_empty()
            && self.hosts.read().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// Replace every bound `${name}` with its port or host IP. Unbound
    /// references stay as they are.
    pub fn substitute(&self, text: &str) -> String {
        let ports = self.ports.read().unwrap_or_else(|e| e.into_inner());
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        VARIABLE_REF
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                match (ports.get(name), hosts.get(name)) {
                    (Some(port), _) => port.to_string(),
                    (None, Some(ip)) => ip.clone(),
                    (None, None) => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Write the bound variables as a `key=value` properties file.
    pub fn write_properties(&self, path: &Path) -> Result<()> {
        let mut entries = self.host_snapshot();
        entries.extend(self.snapshot().into_iter().map(|(k, v)| (k, v.to_string())));

        let mut out = String::from("#Docker ports\n");
        for (name, value) in entries {
            out.push_str(&escape_property_key(&name));
            out.push('=');
            out.push_str(&value);
            out.push('\n');
        }
        std::fs::write(path, out).map_err(|e| PortSpecError::Write {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

fn escape_property_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for c in key.chars() {
        if matches!(c, '=' | ':' | ' ' | '#' | '!' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// A host binding as reported by the engine after start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPort {
    pub container: ContainerPort,
    pub host_ip: String,
    pub host_port: u16,
}

/// The port mappings of one container.
#[derive(Debug)]
pub struct PortMapper {
    specs: Vec<PortSpec>,
    table: std::sync::Arc<DynamicPortTable>,
}

impl PortMapper {
    /// Parse mapping strings. A variable host port that already has a numeric
    /// value, in `variables` or in the table, becomes a fixed port.
    pub fn parse<S: AsRef<str>>(
        specs: &[S],
        variables: &HashMap<String, String>,
        table: std::sync::Arc<DynamicPortTable>,
    ) -> Result<Self> {
        let mut parsed = Vec::with_capacity(specs.len());
        for spec in specs {
            parsed.push(parse_spec(spec.as_ref(), variables, &table)?);
        }
        Ok(Self {
            specs: parsed,
            table,
        })
    }

    pub fn specs(&self) -> &[PortSpec] {
        &self.specs
    }

    pub fn table(&self) -> &DynamicPortTable {
        &self.table
    }

    /// Whether an inspect round trip is needed to learn assigned ports.
    pub fn needs_resolution(&self) -> bool {
        self.specs.iter().any(|s| {
            matches!(&s.host, HostBinding::Variable(name) if self.table.get(name).is_none())
                || matches!(&s.host_ip_variable, Some(name) if self.table.get_host(name).is_none())
        })
    }

    /// `ExposedPorts` keys for the create request.
    pub fn exposed_ports(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.container.to_string()).collect()
    }

    /// `HostConfig.PortBindings` for the create request.
    pub fn to_port_bindings(&self) -> BTreeMap<String, Vec<PortBinding>> {
        self.specs
            .iter()
            .map(|spec| {
                let host_port = match &spec.host {
                    HostBinding::Fixed(port) => port.to_string(),
                    HostBinding::Variable(_) | HostBinding::Unassigned => String::new(),
                };
                let binding = PortBinding {
                    host_ip: spec.bind_interface.map(|ip| ip.to_string()).unwrap_or_default(),
                    host_port,
                };
                (spec.container.to_string(), vec![binding])
            })
            .collect()
    }

    /// Bind every variable whose container port was assigned.
    pub fn resolve(&self, assigned: &BTreeMap<ContainerPort, u16>) -> Result<()> {
        for spec in &self.specs {
            if let HostBinding::Variable(name) = &spec.host
                && let Some(port) = assigned.get(&spec.container)
            {
                self.table.bind(name, *port)?;
            }
        }
        Ok(())
    }

    /// Read the bindings of an inspected container, bind port and host IP
    /// variables and return what was found. `0.0.0.0` is reported as
    /// `docker_host`.
    pub fn resolve_from_container(
        &self,
        details: &ContainerDetails,
        docker_host: &str,
    ) -> Result<Vec<ResolvedPort>> {
        let mut resolved = Vec::new();
        for (key, binding) in details.port_bindings() {
            let Ok(container) = key.parse::<ContainerPort>() else {
                continue;
            };
            let host_port =
                binding
                    .host_port
                    .parse::<u16>()
                    .map_err(|_| PortSpecError::InvalidBinding {
                        container_port: key.clone(),
                        value: binding.host_port.clone(),
                    })?;
            let host_ip = match binding.host_ip.as_str() {
                "0.0.0.0" | "" => docker_host.to_string(),
                ip => ip.to_string(),
            };
            resolved.push(ResolvedPort {
                container,
                host_ip,
                host_port,
            });
        }

        let assigned: BTreeMap<ContainerPort, u16> = resolved
            .iter()
            .map(|r| (r.container, r.host_port))
            .collect();
        self.resolve(&assigned)?;

        for spec in &self.specs {
            if let Some(name) = &spec.host_ip_variable
                && let Some(port) = resolved.iter().find(|r| r.container == spec.container)
            {
                self.table.bind_host(name, &port.host_ip)?;
            }
        }
        Ok(resolved)
    }

    pub fn substitute(&self, text: &str) -> String {
        self.table.substitute(text)
    }
}

fn parse_spec(
    input: &str,
    variables: &HashMap<String, String>,
    table: &DynamicPortTable,
) -> Result<PortSpec> {
    let caps = PROTOCOL_SPLIT
        .captures(input)
        .ok_or_else(|| PortSpecError::MissingColon {
            spec: input.to_string(),
        })?;
    let mapping = caps.get(1).map_or("", |m| m.as_str());
    let protocol = match caps.get(2).map(|m| m.as_str()) {
        Some("udp") => Protocol::Udp,
        _ => Protocol::Tcp,
    };

    let parts: Vec<&str> = mapping.splitn(3, ':').collect();
    let (bind, host, container) = match parts.as_slice() {
        [host, container] => (None, *host, *container),
        [bind, host, container] => (Some(*bind), *host, *container),
        _ => {
            return Err(PortSpecError::MissingColon {
                spec: input.to_string(),
            });
        }
    };

    let container_port =
        container
            .trim()
            .parse::<u16>()
            .map_err(|_| PortSpecError::InvalidContainerPort {
                spec: input.to_string(),
                value: container.to_string(),
            })?;

    let (bind_interface, host_ip_variable) = match bind.map(str::trim) {
        None => (None, None),
        Some(bind) => match host_ip_variable_name(bind) {
            Some(name) => (
                known_host_ip(name, variables, table)?,
                Some(name.to_string()),
            ),
            None => (Some(resolve_host(input, bind)?), None),
        },
    };
    let host = parse_host_port(input, host.trim(), variables, table)?;

    Ok(PortSpec {
        container: ContainerPort {
            port: container_port,
            protocol,
        },
        host,
        bind_interface,
        host_ip_variable,
    })
}

/// `+name` or `${name}` in bind position.
fn host_ip_variable_name(bind: &str) -> Option<&str> {
    bind.strip_prefix('+')
        .or_else(|| bind.strip_prefix("${").and_then(|b| b.strip_suffix('}')))
        .filter(|name| !name.is_empty())
}

/// A host IP variable that already holds an address pins the binding to it.
fn known_host_ip(
    name: &str,
    variables: &HashMap<String, String>,
    table: &DynamicPortTable,
) -> Result<Option<IpAddr>> {
    if let Some(ip) = variables.get(name).and_then(|v| v.trim().parse::<IpAddr>().ok()) {
        table.bind_host(name, &ip.to_string())?;
        return Ok(Some(ip));
    }
    Ok(table.get_host(name).and_then(|v| v.parse::<IpAddr>().ok()))
}

fn parse_host_port(
    input: &str,
    host: &str,
    variables: &HashMap<String, String>,
    table: &DynamicPortTable,
) -> Result<HostBinding> {
    if host.is_empty() {
        return Ok(HostBinding::Unassigned);
    }
    if host.bytes().all(|b| b.is_ascii_digit()) {
        return host
            .parse::<u16>()
            .map(HostBinding::Fixed)
            .map_err(|_| PortSpecError::InvalidHostPort {
                spec: input.to_string(),
                value: host.to_string(),
            });
    }

    let name = host
        .strip_prefix("${")
        .and_then(|h| h.strip_suffix('}'))
        .unwrap_or(host);

    if let Some(port) = variables.get(name).and_then(|v| v.trim().parse::<u16>().ok()) {
        table.bind(name, port)?;
        return Ok(HostBinding::Fixed(port));
    }
    if let Some(port) = table.get(name) {
        return Ok(HostBinding::Fixed(port));
    }
    Ok(HostBinding::Variable(name.to_string()))
}

fn resolve_host(input: &str, host: &str) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let unresolvable = || PortSpecError::UnresolvableHost {
        spec: input.to_string(),
        host: host.to_string(),
    };
    (host, 0)
        .to_socket_addrs()
        .map_err(|_| unresolvable())?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(unresolvable)
}
