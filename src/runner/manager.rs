//! Start and stop a set of containers in dependency order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::model::short_id;
use crate::engine::{ContainerCreateRequest, ContainerDetails, EngineClient};
use crate::naming::{NameResolver, NamingContext};
use crate::order::{NetworkMode, StartOrderResolver};
use crate::ports::{ContainerPort, DynamicPortTable, PortMapper, ResolvedPort};
use crate::runner::config::{RunSpec, WaitSpec};
use crate::runner::error::{Result, RunError};
use crate::wait::{
    ExecCheck, ExitCodeCheck, HealthCheck, HttpCheck, LogPatternCheck, ReadinessPoller, TcpCheck,
};

/// Placeholder for the engine host in env values and wait settings.
const DOCKER_HOST_TOKEN: &str = "${docker.host}";

/// Seconds a container gets to shut down before it is killed.
const STOP_GRACE_SECS: u32 = 10;

/// A container started by the [`Runner`].
#[derive(Debug, Clone)]
pub struct StartedContainer {
    /// Logical name from the run plan.
    pub spec_name: String,
    pub alias: Option<String>,
    pub container_id: String,
    /// Engine name, `None` when the engine picked one.
    pub container_name: Option<String>,
    pub image: String,
    pub ports: Vec<ResolvedPort>,
    pub ip_address: Option<String>,
}

impl StartedContainer {
    pub fn short_id(&self) -> &str {
        short_id(&self.container_id)
    }

    /// The name other containers use to reach this one.
    fn reference(&self) -> String {
        self.container_name
            .clone()
            .unwrap_or_else(|| self.container_id.clone())
    }
}

/// Runs the start sequence: order, name, map ports, create, start, resolve
/// dynamic ports, wait until ready.
///
/// Started containers are tracked so that [`Runner::stop_all`] can tear
/// them down in reverse order.
pub struct Runner {
    client: Arc<EngineClient>,
    config: Config,
    table: Arc<DynamicPortTable>,
    names: NameResolver,
    docker_host: String,
    keep_containers: bool,
    started: RwLock<Vec<StartedContainer>>,
}

impl Runner {
    pub fn new(client: Arc<EngineClient>, config: Config) -> Self {
        let docker_host = client.endpoint().host();
        let names = NameResolver::new(config.naming.max_index);
        Self {
            client,
            config,
            table: Arc::new(DynamicPortTable::new()),
            names,
            docker_host,
            keep_containers: false,
            started: RwLock::new(Vec::new()),
        }
    }

    /// Leave containers running when [`Runner::stop_all`] is called.
    pub fn with_keep_containers(mut self, keep: bool) -> Self {
        self.keep_containers = keep;
        self
    }

    /// Share a port table with other runners or tooling.
    pub fn with_port_table(mut self, table: Arc<DynamicPortTable>) -> Self {
        self.table = table;
        self
    }

    pub fn port_table(&self) -> &Arc<DynamicPortTable> {
        &self.table
    }

    pub fn docker_host(&self) -> &str {
        &self.docker_host
    }

    /// Containers started so far, in start order.
    pub async fn started(&self) -> Vec<StartedContainer> {
        self.started.read().await.clone()
    }

    /// Start every spec, dependencies first.
    ///
    /// `variables` holds port variable values known up front. Containers
    /// started before a failure stay tracked; call [`Runner::stop_all`] to
    /// remove them.
    pub async fn start_all(
        &self,
        specs: Vec<RunSpec>,
        variables: &HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<Vec<StartedContainer>> {
        let mut existing = self.client.container_names().await?;
        let ordered = StartOrderResolver::new()
            .with_existing(existing.iter().cloned())
            .order(specs)?;

        // Logical name or alias -> container reference for links and volumes.
        let mut references: HashMap<String, String> = HashMap::new();
        let mut started = Vec::with_capacity(ordered.len());
        for spec in ordered {
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }
            let container = self
                .start_one(&spec, variables, &references, &existing, cancel.clone())
                .await?;
            let reference = container.reference();
            existing.insert(reference.clone());
            references.insert(spec.name.clone(), reference.clone());
            if let Some(alias) = &spec.alias {
                references.insert(alias.clone(), reference);
            }
            started.push(container);
        }
        Ok(started)
    }

    async fn start_one(
        &self,
        spec: &RunSpec,
        variables: &HashMap<String, String>,
        references: &HashMap<String, String>,
        existing: &HashSet<String>,
        cancel: CancellationToken,
    ) -> Result<StartedContainer> {
        let pattern = spec
            .name_pattern
            .clone()
            .unwrap_or_else(|| self.config.naming.pattern.clone());
        let naming = NamingContext::new(pattern, spec.image.as_str())
            .with_alias(spec.alias.as_deref().unwrap_or(&spec.name))
            .with_existing(existing.iter().cloned());
        let container_name = self.names.calculate_name(&naming)?;

        let mapper = PortMapper::parse(&spec.ports, variables, self.table.clone())?;
        self.ensure_image(&spec.image).await?;

        let request = self.create_request(spec, &mapper, references);
        let shown = container_name.clone().unwrap_or_else(|| spec.name.clone());
        let id = self
            .client
            .create_container(&request, container_name.as_deref())
            .await?;
        tracing::debug!("Created container {} ({})", shown, short_id(&id));

        match self.bring_up(spec, &id, &mapper, cancel).await {
            Ok((details, ports)) => {
                let container = StartedContainer {
                    spec_name: spec.name.clone(),
                    alias: spec.alias.clone(),
                    container_id: id,
                    container_name,
                    image: spec.image.clone(),
                    ports,
                    ip_address: details.ip_address().map(str::to_string),
                };
                tracing::info!(
                    "Container {} ({}) is up",
                    shown,
                    container.short_id()
                );
                self.started.write().await.push(container.clone());
                Ok(container)
            }
            Err(e) => {
                self.discard(&id).await;
                Err(e)
            }
        }
    }

    /// Start, learn assigned ports, wait. The container exists already.
    async fn bring_up(
        &self,
        spec: &RunSpec,
        id: &str,
        mapper: &PortMapper,
        cancel: CancellationToken,
    ) -> Result<(ContainerDetails, Vec<ResolvedPort>)> {
        self.client.start_container(id).await?;
        let details = self
            .client
            .inspect_container(id)
            .await?
            .ok_or_else(|| RunError::Vanished {
                container: spec.name.clone(),
            })?;
        let ports = mapper.resolve_from_container(&details, &self.docker_host)?;
        for port in &ports {
            tracing::debug!(
                "{}: {} -> {}:{}",
                spec.name,
                port.container,
                port.host_ip,
                port.host_port
            );
        }

        if let Some(wait) = &spec.wait {
            let poller = self.build_poller(spec, id, wait, &ports, cancel)?;
            let description = poller.describe();
            let elapsed = poller.wait().await.map_err(|source| RunError::NotReady {
                container: spec.name.clone(),
                source,
            })?;
            if !description.is_empty() {
                tracing::info!(
                    "{}: Waited {} {} ms",
                    spec.name,
                    description,
                    elapsed.as_millis()
                );
            }
        }
        Ok((details, ports))
    }

    fn create_request(
        &self,
        spec: &RunSpec,
        mapper: &PortMapper,
        references: &HashMap<String, String>,
    ) -> ContainerCreateRequest {
        let resolve = |name: &str| {
            references
                .get(name)
                .cloned()
                .unwrap_or_else(|| name.to_string())
        };

        let mut builder = ContainerCreateRequest::builder(spec.image.as_str())
            .ports(mapper.exposed_ports(), mapper.to_port_bindings());
        for (key, value) in &spec.env {
            builder = builder.env(key, &self.substitute(value));
        }
        for (key, value) in &spec.labels {
            builder = builder.label(key, value);
        }
        if let Some(cmd) = &spec.cmd {
            builder = builder.cmd(cmd.clone());
        }
        if let Some(entrypoint) = &spec.entrypoint {
            builder = builder.entrypoint(entrypoint.clone());
        }
        for bind in &spec.binds {
            builder = builder.bind(bind.as_str());
        }
        for volume in &spec.volumes_from {
            builder = builder.volumes_from(resolve(volume));
        }
        if !spec.network.is_custom() {
            for link in &spec.links {
                let (name, alias) = link.rsplit_once(':').unwrap_or((link.as_str(), link.as_str()));
                builder = builder.link(format!("{}:{}", resolve(name), alias));
            }
        }
        match &spec.network {
            NetworkMode::Container(name) => {
                builder = builder.network(format!("container:{}", resolve(name)), Vec::new());
            }
            NetworkMode::Custom(network) => {
                let aliases = spec.alias.iter().cloned().collect();
                builder = builder.network(network.as_str(), aliases);
            }
            other => {
                if let Some(mode) = other.engine_mode() {
                    builder = builder.network(mode, Vec::new());
                }
            }
        }
        builder.build()
    }

    fn build_poller(
        &self,
        spec: &RunSpec,
        id: &str,
        wait: &WaitSpec,
        ports: &[ResolvedPort],
        cancel: CancellationToken,
    ) -> Result<ReadinessPoller> {
        let invalid = |reason: String| RunError::InvalidWait {
            container: spec.name.clone(),
            reason,
        };
        let timeout = wait
            .time_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.wait.timeout);
        let mut poller = ReadinessPoller::new(self.config.wait.interval, timeout)
            .with_running_guard(self.client.clone(), id)
            .with_cancel(cancel);

        if let Some(http) = &wait.http {
            let check = HttpCheck::with_options(
                self.substitute(&http.url),
                http.method.as_deref(),
                http.status.as_deref(),
                http.allow_all_hosts,
            )
            .map_err(|e| invalid(e.to_string()))?;
            poller = poller.with_check(check);
        }
        if let Some(tcp) = &wait.tcp {
            let host = tcp
                .host
                .as_deref()
                .map(|h| self.substitute(h))
                .unwrap_or_else(|| self.docker_host.clone());
            let probe_ports = tcp
                .ports
                .iter()
                .map(|&port| host_port_for(ports, port))
                .collect();
            poller = poller.with_check(TcpCheck::new(host, probe_ports));
        }
        if let Some(pattern) = &wait.log {
            let check = LogPatternCheck::new(self.client.clone(), id, pattern)
                .map_err(|e| invalid(e.to_string()))?;
            poller = poller.with_check(check);
        }
        if wait.healthy {
            poller = poller.with_check(HealthCheck::new(self.client.clone(), id));
        }
        if let Some(command) = &wait.exec {
            if command.is_empty() {
                return Err(invalid("exec command is empty".to_string()));
            }
            poller = poller.with_check(ExecCheck::new(self.client.clone(), id, command.clone()));
        }
        if let Some(code) = wait.exit {
            poller = poller.with_check(ExitCodeCheck::new(self.client.clone(), id, code));
        }
        if let Some(idle) = wait.idle_ms {
            poller = poller.with_min_idle(Duration::from_millis(idle));
        }
        Ok(poller)
    }

    /// Replace `${docker.host}` and resolved port variables.
    pub fn substitute(&self, text: &str) -> String {
        self.table
            .substitute(&text.replace(DOCKER_HOST_TOKEN, &self.docker_host))
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.client.has_image(image).await? {
            return Ok(());
        }
        tracing::info!("Image {} not found locally, pulling", image);
        self.client.pull_image(image, None, None).await?;
        Ok(())
    }

    /// Best-effort removal of a container that failed to come up.
    async fn discard(&self, id: &str) {
        tracing::debug!("Removing container {} after failed start", short_id(id));
        if let Err(e) = self.client.remove_container(id, true).await
            && !e.is_not_found()
        {
            tracing::warn!("Failed to remove container {}: {}", short_id(id), e);
        }
    }

    /// Stop and remove all tracked containers in reverse start order.
    ///
    /// Returns how many were removed. Failures are logged and do not stop
    /// the teardown of the remaining containers.
    pub async fn stop_all(&self) -> usize {
        let containers: Vec<StartedContainer> = std::mem::take(&mut *self.started.write().await);
        if self.keep_containers {
            for container in &containers {
                tracing::info!(
                    "Keeping container {} ({})",
                    container.reference(),
                    container.short_id()
                );
            }
            return 0;
        }

        let mut removed = 0;
        for container in containers.iter().rev() {
            let id = &container.container_id;
            if let Err(e) = self.client.stop_container(id, STOP_GRACE_SECS).await
                && !e.is_not_found()
            {
                tracing::warn!("Failed to stop container {}: {}", container.short_id(), e);
            }
            match self.client.remove_container(id, true).await {
                Ok(()) => {
                    removed += 1;
                    tracing::info!(
                        "Stopped and removed container {} ({})",
                        container.reference(),
                        container.short_id()
                    );
                }
                Err(e) if e.is_not_found() => removed += 1,
                Err(e) => {
                    tracing::warn!("Failed to remove container {}: {}", container.short_id(), e)
                }
            }
        }
        removed
    }
}

/// Host port to probe for `container_port`, or the port itself if unmapped.
fn host_port_for(ports: &[ResolvedPort], container_port: u16) -> u16 {
    let wanted = ContainerPort::tcp(container_port);
    ports
        .iter()
        .find(|p| p.container == wanted)
        .map_or(container_port, |p| p.host_port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ClientOptions, EngineEndpoint};
    use pretty_assertions::assert_eq;

    fn runner() -> Runner {
        let endpoint = EngineEndpoint::from_docker_host("tcp://docker.local:2375", None).unwrap();
        let client = EngineClient::new(endpoint, ClientOptions::default(), "1.41").unwrap();
        Runner::new(Arc::new(client), Config::default())
    }

    fn mapper(runner: &Runner, specs: &[&str]) -> PortMapper {
        PortMapper::parse(specs, &HashMap::new(), runner.port_table().clone()).unwrap()
    }

    #[test]
    fn test_substitute_docker_host_and_ports() {
        let runner = runner();
        runner.port_table().bind("web.port", 32768).unwrap();
        assert_eq!(
            runner.substitute("http://${docker.host}:${web.port}/x ${other}"),
            "http://docker.local:32768/x ${other}"
        );
    }

    #[test]
    fn test_create_request_resolves_links() {
        let runner = runner();
        let mut spec = RunSpec::new("web", "web:1.0");
        spec.links = vec!["db:database".to_string(), "cache".to_string()];
        spec.volumes_from = vec!["data".to_string()];
        spec.env.insert("HOST".to_string(), "${docker.host}".to_string());

        let mut references = HashMap::new();
        references.insert("db".to_string(), "db-1".to_string());
        references.insert("data".to_string(), "data-3".to_string());

        let request = runner.create_request(&spec, &mapper(&runner, &["8080:80"]), &references);
        assert_eq!(
            request.host_config.links,
            vec!["db-1:database".to_string(), "cache:cache".to_string()]
        );
        assert_eq!(request.host_config.volumes_from, vec!["data-3".to_string()]);
        assert_eq!(request.env, vec!["HOST=docker.local".to_string()]);
        assert!(request.exposed_ports.contains_key("80/tcp"));
        assert_eq!(request.host_config.port_bindings["80/tcp"][0].host_port, "8080");
        assert_eq!(request.host_config.network_mode, None);
    }

    #[test]
    fn test_create_request_on_custom_network() {
        let runner = runner();
        let mut spec = RunSpec::new("api", "api:2");
        spec.alias = Some("backend-api".to_string());
        spec.network = NetworkMode::Custom("backend".to_string());
        spec.links = vec!["db".to_string()];

        let request = runner.create_request(&spec, &mapper(&runner, &[]), &HashMap::new());
        assert!(request.host_config.links.is_empty());
        assert_eq!(request.host_config.network_mode.as_deref(), Some("backend"));
        let endpoints = &request.networking_config.as_ref().unwrap().endpoints_config;
        assert_eq!(endpoints["backend"].aliases, vec!["backend-api".to_string()]);
    }

    #[test]
    fn test_host_port_for() {
        let ports = vec![ResolvedPort {
            container: ContainerPort::tcp(5432),
            host_ip: "docker.local".to_string(),
            host_port: 32771,
        }];
        assert_eq!(host_port_for(&ports, 5432), 32771);
        assert_eq!(host_port_for(&ports, 6379), 6379);
    }

    #[test]
    fn test_empty_exec_is_rejected() {
        let runner = runner();
        let spec = RunSpec::new("job", "job:1");
        let wait = WaitSpec {
            exec: Some(Vec::new()),
            ..Default::default()
        };
        let err = runner
            .build_poller(&spec, "abc", &wait, &[], CancellationToken::new())
            .err()
            .unwrap();
        assert!(matches!(err, RunError::InvalidWait { .. }));
    }

    #[tokio::test]
    async fn test_stop_all_with_keep_containers() {
        let runner = runner().with_keep_containers(true);
        runner.started.write().await.push(StartedContainer {
            spec_name: "db".to_string(),
            alias: None,
            container_id: "0123456789abcdef".to_string(),
            container_name: Some("db-1".to_string()),
            image: "postgres:16".to_string(),
            ports: Vec::new(),
            ip_address: None,
        });
        assert_eq!(runner.stop_all().await, 0);
        assert!(runner.started().await.is_empty());
    }
}
