//! Container name calculation from placeholder patterns.
//!
//! Placeholders:
//! - `%a` the image alias
//! - `%n` the image's simple name, with characters outside `[a-zA-Z0-9_.-]`
//!   replaced by `_`
//! - `%t` the build timestamp in epoch milliseconds
//! - `%i` an index starting at 1, chosen to avoid existing names
//! - `%e` alone means "let the engine pick a name"

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

use crate::engine::image_name::{ImageName, ImageNameError};

/// Result type for naming operations.
pub type Result<T> = std::result::Result<T, NamingError>;

/// Default pattern when none is configured.
pub const DEFAULT_NAME_PATTERN: &str = "%n-%i";

/// Default ceiling for the `%i` search.
pub const DEFAULT_MAX_INDEX: u64 = 10_000;

const INDEX_PLACEHOLDER: &str = "%i";
const EMPTY_NAME_PLACEHOLDER: &str = "%e";

static UNSAFE_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_.-]+").expect("static regex"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NamingError {
    /// `%e` must be the whole pattern.
    #[error("Invalid use of container naming pattern '%e' in '{pattern}'")]
    InvalidEmptyPlaceholder { pattern: String },

    #[error("Naming pattern '{pattern}' uses %a but the image has no alias")]
    MissingAlias { pattern: String },

    /// Every index up to the ceiling is taken.
    #[error("Could not find a free container name for pattern '{pattern}' within {max_index} indexes")]
    NameCollisionExhausted { pattern: String, max_index: u64 },

    #[error("Naming pattern '{pattern}' cannot be used for matching: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error(transparent)]
    ImageName(#[from] ImageNameError),
}

/// Input for one naming request.
#[derive(Debug, Clone)]
pub struct NamingContext {
    pub pattern: String,
    pub image_name: String,
    pub alias: Option<String>,
    pub build_timestamp: DateTime<Utc>,
    pub existing_names: HashSet<String>,
}

impl NamingContext {
    pub fn new(pattern: impl Into<String>, image_name: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            image_name: image_name.into(),
            alias: None,
            build_timestamp: Utc::now(),
            existing_names: HashSet::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.build_timestamp = timestamp;
        self
    }

    pub fn with_existing<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.existing_names.extend(names.into_iter().map(Into::into));
        self
    }
}

/// Computes concrete container names.
#[derive(Debug, Clone)]
pub struct NameResolver {
    max_index: u64,
}

impl Default for NameResolver {
    fn default() -> Self {
        Self {
            max_index: DEFAULT_MAX_INDEX,
        }
    }
}

impl NameResolver {
    pub fn new(max_index: u64) -> Self {
        Self {
            max_index: max_index.max(1),
        }
    }

    /// The next free name. `None` when the pattern is `%e`.
    pub fn calculate_name(&self, ctx: &NamingContext) -> Result<Option<String>> {
        if uses_empty_name(&ctx.pattern)? {
            return Ok(None);
        }
        let partial = apply_placeholders(ctx)?;
        if !partial.contains(INDEX_PLACEHOLDER) {
            return Ok(Some(partial));
        }

        for index in 1..=self.max_index {
            let candidate = partial.replace(INDEX_PLACEHOLDER, &index.to_string());
            if !ctx.existing_names.contains(&candidate) {
                return Ok(Some(candidate));
            }
        }
        Err(self.exhausted(&partial))
    }

    /// The most recently created name: the candidate just before the first
    /// free index. `None` for `%e` or when index 1 is free.
    pub fn calculate_last_name(&self, ctx: &NamingContext) -> Result<Option<String>> {
        if uses_empty_name(&ctx.pattern)? {
            return Ok(None);
        }
        let partial = apply_placeholders(ctx)?;
        if !partial.contains(INDEX_PLACEHOLDER) {
            return Ok(Some(partial));
        }

        let mut last = None;
        for index in 1..=self.max_index {
            let candidate = partial.replace(INDEX_PLACEHOLDER, &index.to_string());
            if !ctx.existing_names.contains(&candidate) {
                return Ok(last);
            }
            last = Some(candidate);
        }
        Err(self.exhausted(&partial))
    }

    /// Filter `names` (the containers of one image) down to those this
    /// pattern would have produced, e.g. to decide what to stop.
    ///
    /// - `%e`: every name matches.
    /// - patterns with `%i`: the unbroken run of indexed names starting at 1
    ///   is reduced to its last entry; all other names are kept.
    /// - otherwise `%t` matches `\d{10,}` and the rest must match literally.
    pub fn matching_names(&self, ctx: &NamingContext, names: &[String]) -> Result<Vec<String>> {
        if uses_empty_name(&ctx.pattern)? {
            return Ok(names.to_vec());
        }

        if ctx.pattern.contains(INDEX_PLACEHOLDER) {
            let partial = apply_placeholders(ctx)?;
            let present: HashSet<&str> = names.iter().map(String::as_str).collect();
            let mut earlier = HashSet::new();
            let mut last: Option<String> = None;
            for index in 1..=self.max_index {
                let candidate = partial.replace(INDEX_PLACEHOLDER, &index.to_string());
                if !present.contains(candidate.as_str()) {
                    break;
                }
                if let Some(previous) = last.replace(candidate) {
                    earlier.insert(previous);
                }
            }
            return Ok(names
                .iter()
                .filter(|n| !earlier.contains(n.as_str()))
                .cloned()
                .collect());
        }

        let matcher = matching_regex(ctx)?;
        Ok(names
            .iter()
            .filter(|n| matcher.is_match(n))
            .cloned()
            .collect())
    }

    fn exhausted(&self, partial: &str) -> NamingError {
        NamingError::NameCollisionExhausted {
            pattern: partial.to_string(),
            max_index: self.max_index,
        }
    }
}

fn uses_empty_name(pattern: &str) -> Result<bool> {
    if pattern == EMPTY_NAME_PLACEHOLDER {
        return Ok(true);
    }
    if pattern.contains(EMPTY_NAME_PLACEHOLDER) {
        return Err(NamingError::InvalidEmptyPlaceholder {
            pattern: pattern.to_string(),
        });
    }
    Ok(false)
}

/// `%n` value: the simple image name made safe for container names.
pub fn clean_image_name(image: &str) -> Result<String> {
    let name = ImageName::parse(image)?;
    Ok(UNSAFE_NAME_CHARS
        .replace_all(name.simple_name(), "_")
        .into_owned())
}

/// Substitute `%a`, `%n` and `%t`, leaving `%i` in place.
fn apply_placeholders(ctx: &NamingContext) -> Result<String> {
    render(ctx, |token| match token {
        'a' => alias(ctx).map(str::to_string).map(Some),
        'n' => clean_image_name(&ctx.image_name).map(Some),
        't' => Ok(Some(ctx.build_timestamp.timestamp_millis().to_string())),
        _ => Ok(None),
    })
}

fn matching_regex(ctx: &NamingContext) -> Result<Regex> {
    let literal = |s: &str| regex::escape(s);
    let body = render_with(ctx, literal, |token| match token {
        'a' => alias(ctx).map(|a| Some(regex::escape(a))),
        'n' => clean_image_name(&ctx.image_name).map(|n| Some(regex::escape(&n))),
        't' => Ok(Some(r"\d{10,}".to_string())),
        'i' => Ok(Some(r"\d+".to_string())),
        _ => Ok(None),
    })?;
    Regex::new(&format!("^{}$", body)).map_err(|e| NamingError::InvalidPattern {
        pattern: ctx.pattern.clone(),
        reason: e.to_string(),
    })
}

fn alias(ctx: &NamingContext) -> Result<&str> {
    ctx.alias.as_deref().ok_or_else(|| NamingError::MissingAlias {
        pattern: ctx.pattern.clone(),
    })
}

fn render<F>(ctx: &NamingContext, lookup: F) -> Result<String>
where
    F: Fn(char) -> Result<Option<String>>,
{
    render_with(ctx, str::to_string, lookup)
}

/// Walk the pattern, passing literal runs through `literal` and `%x`
/// tokens through `lookup`. Unknown tokens are kept as written.
fn render_with<L, F>(ctx: &NamingContext, literal: L, lookup: F) -> Result<String>
where
    L: Fn(&str) -> String,
    F: Fn(char) -> Result<Option<String>>,
{
    let mut out = String::with_capacity(ctx.pattern.len() + 16);
    let mut run = String::new();
    let mut chars = ctx.pattern.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '%'
            && let Some(&token) = chars.peek()
        {
            if let Some(value) = lookup(token)? {
                chars.next();
                out.push_str(&literal(&run));
                run.clear();
                out.push_str(&value);
                continue;
            }
        }
        run.push(c);
    }
    out.push_str(&literal(&run));
    Ok(out)
}
