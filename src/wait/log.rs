//! Log pattern readiness check.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use regex::Regex;

use super::{ReadinessCheck, Result, WaitError};
use crate::engine::{EngineClient, LogControl, LogHandle, LogLine};

/// Ready once a line of the container's output matches `pattern`.
///
/// The log follower starts on the first poll and runs in the background.
/// Patterns compiled with the `s` flag (`(?s)...`) are matched against all
/// output seen so far, so they can span several lines.
pub struct LogPatternCheck {
    client: Arc<EngineClient>,
    container_id: String,
    pattern: Regex,
    matched: Arc<AtomicBool>,
    handle: Option<LogHandle>,
}

impl LogPatternCheck {
    pub fn new(
        client: Arc<EngineClient>,
        container_id: impl Into<String>,
        pattern: &str,
    ) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| WaitError::InvalidCheck {
            reason: format!("invalid log pattern '{pattern}': {e}"),
        })?;
        Ok(Self {
            client,
            container_id: container_id.into(),
            pattern,
            matched: Arc::new(AtomicBool::new(false)),
            handle: None,
        })
    }

    fn matcher(&self) -> LogMatcher {
        LogMatcher::new(self.pattern.clone(), self.matched.clone())
    }
}

#[async_trait]
impl ReadinessCheck for LogPatternCheck {
    fn label(&self) -> String {
        format!("on log out '{}'", self.pattern.as_str())
    }

    async fn poll(&mut self) -> Result<bool> {
        if self.handle.is_none() {
            let mut matcher = self.matcher();
            let handle = self
                .client
                .follow_logs(&self.container_id, move |line| matcher.feed(line))
                .await?;
            self.handle = Some(handle);
        }
        Ok(self.matched.load(Ordering::SeqCst))
    }

    async fn cleanup(&mut self) {
        if let Some(handle) = self.handle.take() {
            match handle.finish().await {
                Ok(outcome) => tracing::debug!("Log follower ended: {:?}", outcome),
                Err(e) => tracing::debug!("Log follower failed: {}", e),
            }
        }
    }
}

/// Matches incoming log lines and flips `matched` on the first hit.
struct LogMatcher {
    pattern: Regex,
    matched: Arc<AtomicBool>,
    buffer: Option<String>,
}

impl LogMatcher {
    fn new(pattern: Regex, matched: Arc<AtomicBool>) -> Self {
        let buffer = is_dot_all(&pattern).then(String::new);
        Self {
            pattern,
            matched,
            buffer,
        }
    }

    fn feed(&mut self, line: &LogLine) -> LogControl {
        tracing::trace!("Matching '{}' against {}", line.text, self.pattern.as_str());
        let found = match &mut self.buffer {
            Some(buffer) => {
                buffer.push_str(&line.text);
                buffer.push('\n');
                self.pattern.is_match(buffer)
            }
            None => self.pattern.is_match(&line.text),
        };
        if found {
            tracing::debug!("Found log-wait pattern in log output");
            self.matched.store(true, Ordering::SeqCst);
            LogControl::Stop
        } else {
            LogControl::Continue
        }
    }
}

fn is_dot_all(pattern: &Regex) -> bool {
    let source = pattern.as_str();
    let Some(rest) = source.strip_prefix("(?") else {
        return false;
    };
    rest.split([')', ':'])
        .next()
        .is_some_and(|flags| flags.split('-').next().is_some_and(|on| on.contains('s')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LogStream;

    fn line(text: &str) -> LogLine {
        LogLine::parse(LogStream::Raw, text)
    }

    #[test]
    fn test_single_line_match() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut matcher = LogMatcher::new(Regex::new("ready to accept").unwrap(), flag.clone());

        assert_eq!(matcher.feed(&line("starting up")), LogControl::Continue);
        assert!(!flag.load(Ordering::SeqCst));
        assert_eq!(
            matcher.feed(&line("database system is ready to accept connections")),
            LogControl::Stop
        );
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dot_all_spans_lines() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut matcher = LogMatcher::new(Regex::new("(?s)first.*second").unwrap(), flag.clone());
        assert!(matcher.buffer.is_some());

        assert_eq!(matcher.feed(&line("first step")), LogControl::Continue);
        assert_eq!(matcher.feed(&line("noise")), LogControl::Continue);
        assert_eq!(matcher.feed(&line("second step")), LogControl::Stop);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_without_dot_all_lines_are_separate() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut matcher = LogMatcher::new(Regex::new("first.*second").unwrap(), flag.clone());
        assert!(matcher.buffer.is_none());

        matcher.feed(&line("first step"));
        matcher.feed(&line("second step"));
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dot_all_detection() {
        assert!(is_dot_all(&Regex::new("(?s)a.b").unwrap()));
        assert!(is_dot_all(&Regex::new("(?is)a.b").unwrap()));
        assert!(is_dot_all(&Regex::new("(?s:a.b)").unwrap()));
        assert!(!is_dot_all(&Regex::new("(?i)a.b").unwrap()));
        assert!(!is_dot_all(&Regex::new("(?i-s)a.b").unwrap()));
        assert!(!is_dot_all(&Regex::new("a.b").unwrap()));
    }
}
