//! HTTP ping readiness check.

use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Method, StatusCode, redirect};

use super::{PROBE_TIMEOUT, ReadinessCheck, Result, WaitError};

/// Accepted status codes when none are configured.
pub const DEFAULT_STATUS_RANGE: &str = "200..399";

static RANGE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s*\.\.+\s*(\d+)$").expect("valid regex"));

/// Inclusive range of accepted HTTP status codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRange(RangeInclusive<u16>);

impl StatusRange {
    pub fn contains(&self, status: u16) -> bool {
        self.0.contains(&status)
    }

    pub fn start(&self) -> u16 {
        *self.0.start()
    }

    pub fn end(&self) -> u16 {
        *self.0.end()
    }
}

impl Default for StatusRange {
    fn default() -> Self {
        StatusRange(200..=399)
    }
}

impl FromStr for StatusRange {
    type Err = WaitError;

    /// Parses `"200..399"` (any number of dots) or a single code.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || WaitError::InvalidCheck {
            reason: format!("invalid status range '{s}'"),
        };
        if let Some(caps) = RANGE_PATTERN.captures(s) {
            let start: u16 = caps[1].parse().map_err(|_| invalid())?;
            let end: u16 = caps[2].parse().map_err(|_| invalid())?;
            return Ok(StatusRange(start..=end));
        }
        let code: u16 = s.parse().map_err(|_| invalid())?;
        Ok(StatusRange(code..=code))
    }
}

/// Ready once a request to `url` answers with a status inside the range.
///
/// Redirects are not followed. Transport errors count as "not yet".
pub struct HttpCheck {
    url: String,
    method: Method,
    status: StatusRange,
    client: reqwest::Client,
}

impl HttpCheck {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_options(url, None, None, false)
    }

    /// `method` defaults to `HEAD`, `status` to [`DEFAULT_STATUS_RANGE`].
    /// `allow_all_hosts` disables certificate and host name verification.
    pub fn with_options(
        url: impl Into<String>,
        method: Option<&str>,
        status: Option<&str>,
        allow_all_hosts: bool,
    ) -> Result<Self> {
        let url = url.into();
        let method = match method {
            Some(m) => Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).map_err(
                |_| WaitError::InvalidCheck {
                    reason: format!("invalid HTTP method '{m}'"),
                },
            )?,
            None => Method::HEAD,
        };
        let status = match status {
            Some(s) => s.parse()?,
            None => StatusRange::default(),
        };
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .connect_timeout(PROBE_TIMEOUT)
            .redirect(redirect::Policy::none())
            .danger_accept_invalid_certs(allow_all_hosts)
            .build()
            .map_err(|e| WaitError::InvalidCheck {
                reason: format!("cannot build HTTP client for {url}: {e}"),
            })?;
        Ok(Self {
            url,
            method,
            status,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status_range(&self) -> &StatusRange {
        &self.status
    }
}

#[async_trait]
impl ReadinessCheck for HttpCheck {
    fn label(&self) -> String {
        format!("on url {}", self.url)
    }

    async fn poll(&mut self) -> Result<bool> {
        let response = match self
            .client
            .request(self.method.clone(), &self.url)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::trace!("Ping {} failed: {}", self.url, e);
                return Ok(false);
            }
        };
        let status = response.status();
        if status == StatusCode::NOT_IMPLEMENTED {
            return Err(WaitError::CheckFailed {
                check: self.label(),
                reason: format!("method {} is not supported by the server", self.method),
            });
        }
        Ok(self.status.contains(status.as_u16()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_range_parsing() {
        let range: StatusRange = "200..399".parse().unwrap();
        assert_eq!((range.start(), range.end()), (200, 399));

        let range: StatusRange = "200 ... 204".parse().unwrap();
        assert!(range.contains(204));
        assert!(!range.contains(205));

        let single: StatusRange = "204".parse().unwrap();
        assert!(single.contains(204));
        assert!(!single.contains(200));

        assert!("ok".parse::<StatusRange>().is_err());
        assert!("200..".parse::<StatusRange>().is_err());
    }

    #[test]
    fn test_defaults() {
        let check = HttpCheck::new("http://127.0.0.1:8080/health").unwrap();
        assert_eq!(check.method, Method::HEAD);
        assert_eq!(check.status_range(), &StatusRange::default());
        assert_eq!(check.label(), "on url http://127.0.0.1:8080/health");
    }

    #[test]
    fn test_method_is_normalized() {
        let check =
            HttpCheck::with_options("http://localhost/", Some("get"), Some("200"), true).unwrap();
        assert_eq!(check.method, Method::GET);
        assert!(HttpCheck::with_options("http://localhost/", Some("BAD METHOD"), None, false).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_counts_as_not_ready() {
        // Port 9 (discard) is closed on test machines.
        let mut check = HttpCheck::new("http://127.0.0.1:9/").unwrap();
        assert!(!check.poll().await.unwrap());
    }
}
