//! Dependency-ordered container start sequence.
//!
//! A container depends on the containers it takes volumes from, links to,
//! shares a network namespace with (`container:<name>`), or names in
//! `depends_on`. Links only count on the default networks, since
//! user-defined networks resolve peers by name and tolerate circular links.
//! `depends_on` only counts on user-defined networks.
//!
//! Resolution runs in passes. Containers without dependencies come first in
//! input order. Each later pass appends, in input order, every remaining
//! container whose dependencies are all started or already exist on the
//! engine. A pass that makes no progress means a cycle or a dependency that
//! nothing provides.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for ordering.
pub type Result<T> = std::result::Result<T, OrderError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderError {
    #[error("Cyclic dependency between containers: {}", .members.join(" -> "))]
    CyclicDependency { members: Vec<String> },

    /// Dependencies that neither a spec nor an existing container provides.
    #[error("Cannot resolve start order: {}", describe_missing(.missing))]
    UnresolvedDependencies { missing: Vec<(String, String)> },
}

fn describe_missing(missing: &[(String, String)]) -> String {
    missing
        .iter()
        .map(|(name, dep)| format!("{} depends on unknown '{}'", name, dep))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Anything that can be placed in a start order.
pub trait Dependent {
    fn name(&self) -> &str;

    fn alias(&self) -> Option<&str> {
        None
    }

    /// Names or aliases this container needs running first.
    fn dependencies(&self) -> Vec<String>;
}

/// Network attachment as declared for a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum NetworkMode {
    #[default]
    Default,
    Bridge,
    Host,
    None,
    /// Share the network stack of another container.
    Container(String),
    /// A user-defined network.
    Custom(String),
}

impl NetworkMode {
    pub fn parse(mode: &str) -> Self {
        match mode {
            "" | "default" => NetworkMode::Default,
            "bridge" => NetworkMode::Bridge,
            "host" => NetworkMode::Host,
            "none" => NetworkMode::None,
            other => match other.strip_prefix("container:") {
                Some(name) => NetworkMode::Container(name.to_string()),
                None => NetworkMode::Custom(other.to_string()),
            },
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, NetworkMode::Custom(_))
    }

    /// The container whose network is shared, if any.
    pub fn container_alias(&self) -> Option<&str> {
        match self {
            NetworkMode::Container(name) => Some(name),
            _ => None,
        }
    }

    /// Value for `HostConfig.NetworkMode`. `None` for the engine default.
    pub fn engine_mode(&self) -> Option<String> {
        match self {
            NetworkMode::Default => None,
            other => Some(String::from(other.clone())),
        }
    }
}

impl From<String> for NetworkMode {
    fn from(mode: String) -> Self {
        NetworkMode::parse(&mode)
    }
}

impl From<NetworkMode> for String {
    fn from(mode: NetworkMode) -> Self {
        match mode {
            NetworkMode::Default => "default".to_string(),
            NetworkMode::Bridge => "bridge".to_string(),
            NetworkMode::Host => "host".to_string(),
            NetworkMode::None => "none".to_string(),
            NetworkMode::Container(name) => format!("container:{}", name),
            NetworkMode::Custom(name) => name,
        }
    }
}

/// Declarations that create start-order edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Declarations {
    pub volumes_from: Vec<String>,
    /// `name` or `name:alias`.
    pub links: Vec<String>,
    pub network: NetworkMode,
    pub depends_on: Vec<String>,
}

impl Declarations {
    /// Dependency names in declaration order, without duplicates.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = Vec::new();
        let mut push = |dep: &str| {
            if !dep.is_empty() && !deps.iter().any(|d| d == dep) {
                deps.push(dep.to_string());
            }
        };

        for volume in &self.volumes_from {
            push(volume);
        }
        if !self.network.is_custom() {
            for link in &self.links {
                let name = link.rsplit_once(':').map_or(link.as_str(), |(name, _)| name);
                push(name);
            }
        }
        if let Some(alias) = self.network.container_alias() {
            push(alias);
        }
        if self.network.is_custom() {
            for dep in &self.depends_on {
                push(dep);
            }
        }
        deps
    }
}

/// The unit handled by [`StartOrderResolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub alias: Option<String>,
    pub dependencies: Vec<String>,
}

impl ContainerSpec {
    pub fn new<I, S>(name: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            alias: None,
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_declarations(
        name: impl Into<String>,
        alias: Option<String>,
        declarations: &Declarations,
    ) -> Self {
        Self {
            name: name.into(),
            alias,
            dependencies: declarations.dependencies(),
        }
    }
}

impl Dependent for ContainerSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }
}

/// Orders specs so that every dependency starts before its dependents.
#[derive(Debug, Clone, Default)]
pub struct StartOrderResolver {
    existing: HashSet<String>,
}

impl StartOrderResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of containers already present on the engine. A dependency on
    /// one of them is satisfied without a spec.
    pub fn with_existing<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.existing.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn order<T: Dependent>(&self, specs: Vec<T>) -> Result<Vec<T>> {
        let mut started: HashSet<String> = HashSet::new();
        let mut ordered = Vec::with_capacity(specs.len());
        let mut remaining = Vec::new();

        for spec in specs {
            if spec.dependencies().is_empty() {
                mark_started(&mut started, &spec);
                ordered.push(spec);
            } else {
                remaining.push(spec);
            }
        }

        while !remaining.is_empty() {
            let mut progressed = false;
            let mut blocked = Vec::with_capacity(remaining.len());
            for spec in remaining {
                let ready = spec
                    .dependencies()
                    .iter()
                    .all(|dep| started.contains(dep) || self.existing.contains(dep));
                if ready {
                    mark_started(&mut started, &spec);
                    ordered.push(spec);
                    progressed = true;
                } else {
                    blocked.push(spec);
                }
            }
            remaining = blocked;

            if !progressed {
                return Err(self.explain(&remaining, &started));
            }
        }

        tracing::debug!(
            "Start order: {}",
            ordered.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
        );
        Ok(ordered)
    }

    /// Turn a stuck pass into a cycle report, or a list of unknown names.
    fn explain<T: Dependent>(&self, blocked: &[T], started: &HashSet<String>) -> OrderError {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, spec) in blocked.iter().enumerate() {
            index.insert(spec.name(), i);
            if let Some(alias) = spec.alias() {
                index.insert(alias, i);
            }
        }

        let edges: Vec<Vec<usize>> = blocked
            .iter()
            .map(|spec| {
                spec.dependencies()
                    .iter()
                    .filter_map(|dep| index.get(dep.as_str()).copied())
                    .collect()
            })
            .collect();

        if let Some(cycle) = find_cycle(&edges) {
            return OrderError::CyclicDependency {
                members: cycle
                    .into_iter()
                    .map(|i| blocked[i].name().to_string())
                    .collect(),
            };
        }

        let missing = blocked
            .iter()
            .flat_map(|spec| {
                spec.dependencies()
                    .into_iter()
                    .filter(|dep| {
                        !started.contains(dep)
                            && !self.existing.contains(dep)
                            && !index.contains_key(dep.as_str())
                    })
                    .map(|dep| (spec.name().to_string(), dep))
                    .collect::<Vec<_>>()
            })
            .collect();
        OrderError::UnresolvedDependencies { missing }
    }
}

fn mark_started<T: Dependent>(started: &mut HashSet<String>, spec: &T) {
    started.insert(spec.name().to_string());
    if let Some(alias) = spec.alias() {
        started.insert(alias.to_string());
    }
}

/// First cycle found by depth-first search, in dependency order.
fn find_cycle(edges: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    fn visit(node: usize, edges: &[Vec<usize>], marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[node] = Mark::Active;
        path.push(node);
        for &next in &edges[node] {
            match marks[next] {
                Mark::Active => {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    return Some(path[start..].to_vec());
                }
                Mark::New => {
                    if let Some(cycle) = visit(next, edges, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        path.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; edges.len()];
    let mut path = Vec::new();
    for node in 0..edges.len() {
        if marks[node] == Mark::New
            && let Some(cycle) = visit(node, edges, &mut marks, &mut path)
        {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn names(specs: &[ContainerSpec]) -> Vec<&str> {
        specs.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_chain_is_ordered() {
        let resolver = StartOrderResolver::new();
        let specs = vec![
            ContainerSpec::new("A", Vec::<String>::new()),
            ContainerSpec::new("B", ["A"]),
            ContainerSpec::new("C", ["B"]),
        ];
        assert_eq!(names(&resolver.order(specs).unwrap()), vec!["A", "B", "C"]);

        let reversed = vec![
            ContainerSpec::new("C", ["B"]),
            ContainerSpec::new("B", ["A"]),
            ContainerSpec::new("A", Vec::<String>::new()),
        ];
        assert_eq!(
            names(&resolver.order(reversed).unwrap()),
            vec!["A", "B", "C"]
        );
    }

    #[test]
    fn test_cycle_is_reported() {
        let specs = vec![ContainerSpec::new("A", ["B"]), ContainerSpec::new("B", ["A"])];
        let err = StartOrderResolver::new().order(specs).unwrap_err();
        assert_eq!(
            err,
            OrderError::CyclicDependency {
                members: vec!["A".to_string(), "B".to_string()],
            }
        );
    }

    #[test]
    fn test_cycle_members_exclude_bystanders() {
        let specs = vec![
            ContainerSpec::new("web", ["api"]),
            ContainerSpec::new("api", ["db"]),
            ContainerSpec::new("db", ["api"]),
        ];
        match StartOrderResolver::new().order(specs).unwrap_err() {
            OrderError::CyclicDependency { members } => assert_eq!(members, vec!["api", "db"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_independent_specs_keep_input_order() {
        let specs = vec![
            ContainerSpec::new("z", Vec::<String>::new()),
            ContainerSpec::new("web", ["db"]),
            ContainerSpec::new("a", Vec::<String>::new()),
            ContainerSpec::new("db", Vec::<String>::new()),
            ContainerSpec::new("worker", ["db"]),
        ];
        let ordered = StartOrderResolver::new().order(specs).unwrap();
        assert_eq!(names(&ordered), vec!["z", "a", "db", "web", "worker"]);
    }

    #[test]
    fn test_alias_satisfies_dependency() {
        let mut db = ContainerSpec::new("postgres:16", Vec::<String>::new());
        db.alias = Some("db".to_string());
        let specs = vec![ContainerSpec::new("app", ["db"]), db];
        let ordered = StartOrderResolver::new().order(specs).unwrap();
        assert_eq!(names(&ordered), vec!["postgres:16", "app"]);
    }

    #[test]
    fn test_existing_container_satisfies_dependency() {
        let specs = vec![ContainerSpec::new("app", ["external-db"])];
        let err = StartOrderResolver::new().order(specs.clone()).unwrap_err();
        assert_eq!(
            err,
            OrderError::UnresolvedDependencies {
                missing: vec![("app".to_string(), "external-db".to_string())],
            }
        );

        let ordered = StartOrderResolver::new()
            .with_existing(["external-db"])
            .order(specs)
            .unwrap();
        assert_eq!(names(&ordered), vec!["app"]);
    }

    #[test]
    fn test_declared_dependencies_on_default_network() {
        let declarations = Declarations {
            volumes_from: vec!["data".to_string()],
            links: vec!["db:database".to_string(), "cache".to_string(), "data".to_string()],
            network: NetworkMode::Default,
            depends_on: vec!["ignored".to_string()],
        };
        assert_eq!(declarations.dependencies(), vec!["data", "db", "cache"]);
    }

    #[test]
    fn test_declared_dependencies_on_custom_network() {
        let declarations = Declarations {
            links: vec!["db:database".to_string()],
            network: NetworkMode::parse("backend"),
            depends_on: vec!["db".to_string(), "queue".to_string()],
            ..Default::default()
        };
        assert_eq!(declarations.dependencies(), vec!["db", "queue"]);
    }

    #[test]
    fn test_container_network_is_a_dependency() {
        let declarations = Declarations {
            network: NetworkMode::parse("container:vpn"),
            ..Default::default()
        };
        assert_eq!(declarations.dependencies(), vec!["vpn"]);
        assert_eq!(
            declarations.network.engine_mode(),
            Some("container:vpn".to_string())
        );
    }
}
