//! Run plans: the containers to start, read from TOML.
//!
//! ```toml
//! keep_containers = false
//! port_properties = "target/ports.properties"
//!
//! [variables]
//! "db.port" = "15432"
//!
//! [[container]]
//! name = "db"
//! image = "postgres:16"
//! ports = ["db.port:5432"]
//! env = { POSTGRES_PASSWORD = "secret" }
//!
//! [container.wait]
//! log = "ready to accept connections"
//! time_ms = 30000
//!
//! [[container]]
//! name = "web"
//! image = "registry.local/team/web:1.0"
//! ports = ["web.port:8080"]
//! links = ["db:database"]
//! env = { DB_URL = "postgres://database:5432/app" }
//!
//! [container.wait.http]
//! url = "http://${docker.host}:${web.port}/health"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::order::{Declarations, Dependent, NetworkMode};

/// A whole run plan.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunPlan {
    /// Leave containers running when the plan is torn down.
    #[serde(default)]
    pub keep_containers: bool,
    /// Where to write resolved port variables as a properties file.
    #[serde(default)]
    pub port_properties: Option<PathBuf>,
    /// Values for port variables known up front.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default, rename = "container")]
    pub containers: Vec<RunSpec>,
}

impl RunPlan {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::InvalidValue {
            key: "run plan".to_string(),
            message: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// One container to start.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSpec {
    /// Logical name other specs refer to.
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub alias: Option<String>,
    /// Container naming pattern, overriding the configured default.
    #[serde(default)]
    pub name_pattern: Option<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    /// `${var}` tokens are replaced with resolved port variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub binds: Vec<String>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub volumes_from: Vec<String>,
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub wait: Option<WaitSpec>,
}

impl RunSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn declarations(&self) -> Declarations {
        Declarations {
            volumes_from: self.volumes_from.clone(),
            links: self.links.clone(),
            network: self.network.clone(),
            depends_on: self.depends_on.clone(),
        }
    }
}

impl Dependent for RunSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    fn dependencies(&self) -> Vec<String> {
        self.declarations().dependencies()
    }
}

/// Readiness conditions for one container. All configured conditions must
/// hold.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitSpec {
    #[serde(default)]
    pub http: Option<HttpWait>,
    #[serde(default)]
    pub tcp: Option<TcpWait>,
    /// Regex matched against the container output.
    #[serde(default)]
    pub log: Option<String>,
    /// Wait for the Docker HEALTHCHECK to report healthy.
    #[serde(default)]
    pub healthy: bool,
    /// Command run inside the container until it exits with 0.
    #[serde(default)]
    pub exec: Option<Vec<String>>,
    /// Wait for the container to exit with this code.
    #[serde(default)]
    pub exit: Option<i64>,
    /// Wait budget, overriding the configured default.
    #[serde(default)]
    pub time_ms: Option<u64>,
    /// Fixed pause used when no condition is configured.
    #[serde(default)]
    pub idle_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpWait {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub allow_all_hosts: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcpWait {
    /// Defaults to the engine host.
    #[serde(default)]
    pub host: Option<String>,
    /// Container ports; mapped ports are probed on their host port.
    pub ports: Vec<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::StartOrderResolver;
    use pretty_assertions::assert_eq;

    const PLAN: &str = r#"
        keep_containers = true
        port_properties = "ports.properties"

        [variables]
        "db.port" = "15432"

        [[container]]
        name = "web"
        image = "web:1.0"
        ports = ["web.port:8080"]
        links = ["db:database"]
        env = { DB_URL = "postgres://database:${db.port}/app" }

        [container.wait]
        time_ms = 2000

        [container.wait.http]
        url = "http://localhost:${web.port}/health"
        status = "200..299"

        [[container]]
        name = "db"
        image = "postgres:16"
        ports = ["db.port:5432"]

        [container.wait]
        log = "ready to accept connections"
    "#;

    #[test]
    fn test_parse_plan() {
        let plan = RunPlan::parse(PLAN).unwrap();
        assert!(plan.keep_containers);
        assert_eq!(plan.port_properties, Some(PathBuf::from("ports.properties")));
        assert_eq!(plan.variables.get("db.port").map(String::as_str), Some("15432"));
        assert_eq!(plan.containers.len(), 2);

        let web = &plan.containers[0];
        assert_eq!(web.dependencies(), vec!["db".to_string()]);
        let wait = web.wait.as_ref().unwrap();
        assert_eq!(wait.time_ms, Some(2000));
        assert_eq!(wait.http.as_ref().unwrap().status.as_deref(), Some("200..299"));

        let db = &plan.containers[1];
        assert_eq!(
            db.wait.as_ref().unwrap().log.as_deref(),
            Some("ready to accept connections")
        );
    }

    #[test]
    fn test_plan_orders_by_links() {
        let plan = RunPlan::parse(PLAN).unwrap();
        let ordered = StartOrderResolver::new().order(plan.containers).unwrap();
        let names: Vec<&str> = ordered.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["db", "web"]);
    }

    #[test]
    fn test_custom_network_uses_depends_on() {
        let plan = RunPlan::parse(
            r#"
            [[container]]
            name = "app"
            image = "app"
            network = "backend"
            links = ["cache"]
            depends_on = ["db"]
            "#,
        )
        .unwrap();
        assert_eq!(plan.containers[0].network, NetworkMode::Custom("backend".into()));
        assert_eq!(plan.containers[0].dependencies(), vec!["db".to_string()]);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let err = RunPlan::parse("[[container]]\nname = \"a\"\nimage = \"b\"\nport = []\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunPlan::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::File { .. }));
    }
}
