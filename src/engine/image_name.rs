//! Docker image reference parsing.
//!
//! A reference has the shape `[registry/][user/]repository[:tag][@digest]`.
//! The first path component is treated as a registry when it contains a `.`
//! or a `:` (e.g. `docker.example.com:5000/team/app:1.0`).

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Errors produced while parsing an image reference.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageNameError {
    /// The reference is empty or cannot be split into name and tag.
    #[error("'{name}' is not a proper image name ([registry/][repo][:port])")]
    Malformed {
        /// The rejected input.
        name: String,
    },

    /// One or more components violate the Docker reference grammar.
    #[error("Given Docker name '{name}' is invalid: {}", .problems.join("; "))]
    Invalid {
        /// The rejected input.
        name: String,
        /// One entry per offending component.
        problems: Vec<String>,
    },
}

static TAG_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?)(?::([^:/]+))?$").expect("static regex"));

const NAME_COMPONENT: &str = r"[a-z0-9]+(?:(?:(?:[._]|__|[-]*)[a-z0-9]+)+)?";
const DOMAIN_COMPONENT: &str = r"(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])";

static NAME_COMPONENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^{NAME_COMPONENT}$")).expect("static regex"));
static IMAGE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{NAME_COMPONENT}(?:(?:/{NAME_COMPONENT})+)?$")).expect("static regex")
});
static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^{DOMAIN_COMPONENT}(?:\.{DOMAIN_COMPONENT})*(?::[0-9]+)?$"
    ))
    .expect("static regex")
});
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("static regex"));
static DIGEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sha256:[a-z0-9]{32,}$").expect("static regex"));

/// A parsed Docker image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    registry: Option<String>,
    user: Option<String>,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageName {
    /// Parse a full image reference. A missing tag (and digest) defaults to `latest`.
    pub fn parse(full_name: &str) -> Result<Self, ImageNameError> {
        Self::with_tag(full_name, None)
    }

    /// Parse a reference, overriding its tag with `given_tag` when present.
    pub fn with_tag(full_name: &str, given_tag: Option<&str>) -> Result<Self, ImageNameError> {
        let malformed = || ImageNameError::Malformed {
            name: full_name.to_string(),
        };
        if full_name.trim().is_empty() {
            return Err(malformed());
        }

        let (rest, digest) = match full_name.split_once("@sha256") {
            Some(_) => {
                let (name, digest) = full_name.split_once('@').ok_or_else(malformed)?;
                (name, Some(digest.to_string()))
            }
            None => (full_name, None),
        };

        let caps = TAG_SPLIT.captures(rest).ok_or_else(malformed)?;
        let before_tag = caps.get(1).map(|m| m.as_str()).ok_or_else(malformed)?;
        let mut tag = given_tag
            .map(str::to_string)
            .or_else(|| caps.get(2).map(|m| m.as_str().to_string()));

        let parts: Vec<&str> = before_tag.split('/').map(str::trim).collect();
        let (registry, user, repository) = match parts.as_slice() {
            [single] => (None, None, single.to_string()),
            [first, second] if is_registry(first) => {
                (Some(first.to_string()), None, second.to_string())
            }
            [first, rest @ ..] if is_registry(first) => (
                Some(first.to_string()),
                Some(rest[0].to_string()),
                rest.join("/"),
            ),
            [first, ..] => (None, Some(first.to_string()), parts.join("/")),
            [] => return Err(malformed()),
        };

        if tag.is_none() && digest.is_none() {
            tag = Some("latest".to_string());
        }

        let name = Self {
            registry,
            user,
            repository,
            tag,
            digest,
        };
        name.validate()?;
        Ok(name)
    }

    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Repository including the user part, without registry and tag.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    pub fn has_registry(&self) -> bool {
        self.registry.as_deref().is_some_and(|r| !r.is_empty())
    }

    /// Registry (own, else `optional_registry`) plus repository, without tag.
    pub fn name_without_tag(&self, optional_registry: Option<&str>) -> String {
        match self.registry.as_deref().or(optional_registry) {
            Some(registry) => format!("{}/{}", registry, self.repository),
            None => self.repository.clone(),
        }
    }

    /// Full reference including tag and digest, with an optional fallback registry.
    pub fn full_name(&self, optional_registry: Option<&str>) -> String {
        let mut name = self.name_without_tag(optional_registry);
        if let Some(tag) = &self.tag {
            name.push(':');
            name.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            name.push('@');
            name.push_str(digest);
        }
        name
    }

    /// The repository without its user prefix (`team/app` → `app`).
    pub fn simple_name(&self) -> &str {
        match &self.user {
            Some(user) => self
                .repository
                .strip_prefix(user.as_str())
                .and_then(|r| r.strip_prefix('/'))
                .unwrap_or(&self.repository),
            None => &self.repository,
        }
    }

    fn validate(&self) -> Result<(), ImageNameError> {
        let image = self.simple_name();
        let checks: [(&str, &Regex, Option<&str>); 5] = [
            ("registry", &DOMAIN_RE, self.registry.as_deref()),
            ("image", &IMAGE_NAME_RE, Some(image)),
            ("user", &NAME_COMPONENT_RE, self.user.as_deref()),
            ("tag", &TAG_RE, self.tag.as_deref()),
            ("digest", &DIGEST_RE, self.digest.as_deref()),
        ];

        let problems: Vec<String> = checks
            .iter()
            .filter_map(|(label, re, value)| {
                value
                    .filter(|v| !re.is_match(v))
                    .map(|v| format!("{label} part '{v}' doesn't match allowed pattern"))
            })
            .collect();

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ImageNameError::Invalid {
                name: self.full_name(None),
                problems,
            })
        }
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name(None))
    }
}

fn is_registry(part: &str) -> bool {
    part.contains('.') || part.contains(':')
}
