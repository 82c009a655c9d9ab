//! Readiness waits for freshly started containers.
//!
//! A [`ReadinessPoller`] holds a set of [`ReadinessCheck`]s and polls them
//! on a fixed interval until every one of them has passed, the wait budget
//! runs out, a check fails for good or the wait is cancelled.
//!
//! ```text
//!   Idle ──wait()──▶ Polling ──all checks passed──▶ Satisfied
//!                      │  │
//!                      │  └──budget exhausted────▶ TimedOut
//!                      └────fatal check / stopped▶ Failed
//! ```
//!
//! Whatever the outcome, every check is cleaned up exactly once before
//! [`ReadinessPoller::wait`] returns.

mod error;
mod exec;
mod exit;
mod health;
mod http;
mod log;
mod tcp;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::engine::EngineClient;

pub use error::{Result, WaitError};
pub use exec::ExecCheck;
pub use exit::ExitCodeCheck;
pub use health::HealthCheck;
pub use http::{DEFAULT_STATUS_RANGE, HttpCheck, StatusRange};
pub use log::LogPatternCheck;
pub use tcp::TcpCheck;

/// Default pause between two polling rounds.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default wait budget.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout applied to a single HTTP or TCP probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// One condition a container has to meet before it counts as ready.
#[async_trait]
pub trait ReadinessCheck: Send {
    /// Human readable description used in log and error messages.
    fn label(&self) -> String;

    /// Evaluate the condition once.
    ///
    /// `Ok(false)` means "not yet" and the check is polled again on the
    /// next tick. An error ends the wait.
    async fn poll(&mut self) -> Result<bool>;

    /// Release whatever the check holds (log followers and the like).
    async fn cleanup(&mut self) {}

    /// Whether this check expects the container to exit.
    fn expects_exit(&self) -> bool {
        false
    }
}

/// Where a wait currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Idle,
    Polling,
    Satisfied,
    TimedOut,
    Failed,
}

/// Stops the wait as soon as the container is no longer running.
struct RunningGuard {
    client: Arc<EngineClient>,
    container_id: String,
}

impl RunningGuard {
    async fn check(&self) -> Result<()> {
        let details = self.client.inspect_container(&self.container_id).await?;
        let exit_code = match details {
            Some(d) if d.is_running() => return Ok(()),
            Some(d) => d.exit_code(),
            None => None,
        };
        self.dump_logs().await;
        Err(WaitError::NotRunning {
            container: self.container_id.clone(),
            exit_code,
        })
    }

    async fn dump_logs(&self) {
        match self.client.logs(&self.container_id).await {
            Ok(lines) => {
                let id = crate::engine::model::short_id(&self.container_id);
                for line in lines {
                    tracing::info!("[{}] {}", id, line.text);
                }
            }
            Err(e) => tracing::debug!("Could not fetch logs of {}: {}", self.container_id, e),
        }
    }
}

/// Polls a set of readiness checks until all of them pass.
pub struct ReadinessPoller {
    checks: Vec<Box<dyn ReadinessCheck>>,
    interval: Duration,
    timeout: Duration,
    min_idle: Option<Duration>,
    guard: Option<RunningGuard>,
    cancel: CancellationToken,
    state: WaitState,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT)
    }
}

impl ReadinessPoller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            checks: Vec::new(),
            interval,
            timeout,
            min_idle: None,
            guard: None,
            cancel: CancellationToken::new(),
            state: WaitState::Idle,
        }
    }

    pub fn with_check(mut self, check: impl ReadinessCheck + 'static) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    pub fn with_boxed_check(mut self, check: Box<dyn ReadinessCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Sleep for `idle` instead of polling when no checks are configured.
    pub fn with_min_idle(mut self, idle: Duration) -> Self {
        self.min_idle = Some(idle);
        self
    }

    /// Fail fast once `container_id` stops running.
    ///
    /// Ignored when one of the checks waits for the container to exit.
    pub fn with_running_guard(
        mut self,
        client: Arc<EngineClient>,
        container_id: impl Into<String>,
    ) -> Self {
        self.guard = Some(RunningGuard {
            client,
            container_id: container_id.into(),
        });
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> WaitState {
        self.state
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty() && self.min_idle.is_none()
    }

    /// Labels of all configured checks, joined for log output.
    pub fn describe(&self) -> String {
        self.checks
            .iter()
            .map(|c| c.label())
            .collect::<Vec<_>>()
            .join(" and ")
    }

    /// Run the wait and return how long it took.
    pub async fn wait(mut self) -> Result<Duration> {
        let start = Instant::now();
        self.state = WaitState::Polling;

        let result = if self.checks.is_empty() {
            self.idle(start).await
        } else {
            let deadline = start + self.timeout;
            let cancel = self.cancel.clone();
            let mut satisfied = vec![false; self.checks.len()];
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(WaitError::cancelled(start.elapsed())),
                _ = tokio::time::sleep_until(deadline.into()) => Err(WaitError::timeout(
                    start.elapsed(),
                    String::new(),
                )),
                r = self.poll_until_ready(&mut satisfied) => r,
            };
            match outcome {
                Err(WaitError::Timeout { elapsed_millis, .. }) => Err(WaitError::Timeout {
                    elapsed_millis,
                    pending: self.pending_labels(&satisfied),
                }),
                other => other.map(|()| start.elapsed()),
            }
        };

        for check in &mut self.checks {
            check.cleanup().await;
        }

        self.state = match &result {
            Ok(_) => WaitState::Satisfied,
            Err(WaitError::Timeout { .. }) => WaitState::TimedOut,
            Err(_) => WaitState::Failed,
        };
        match &result {
            Ok(elapsed) => tracing::debug!("{:?} after {} ms", self.state, elapsed.as_millis()),
            Err(e) => tracing::debug!("{:?}: {}", self.state, e),
        }
        result
    }

    async fn idle(&self, start: Instant) -> Result<Duration> {
        if let Some(idle) = self.min_idle {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(WaitError::cancelled(start.elapsed())),
                _ = tokio::time::sleep(idle) => {}
            }
        }
        Ok(start.elapsed())
    }

    async fn poll_until_ready(&mut self, satisfied: &mut [bool]) -> Result<()> {
        let guarded = !self.checks.iter().any(|c| c.expects_exit());
        loop {
            if guarded && let Some(guard) = &self.guard {
                guard.check().await?;
            }
            for (check, done) in self.checks.iter_mut().zip(satisfied.iter_mut()) {
                if *done {
                    continue;
                }
                if check.poll().await? {
                    tracing::debug!("Readiness check passed: {}", check.label());
                    *done = true;
                }
            }
            if satisfied.iter().all(|done| *done) {
                return Ok(());
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    fn pending_labels(&self, satisfied: &[bool]) -> String {
        self.checks
            .iter()
            .zip(satisfied)
            .filter(|(_, done)| !**done)
            .map(|(c, _)| c.label())
            .collect::<Vec<_>>()
            .join(" and ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted {
        answers: Vec<bool>,
        polls: Arc<AtomicUsize>,
        cleanups: Arc<AtomicUsize>,
        fatal: bool,
    }

    impl Counted {
        fn new(answers: Vec<bool>) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let polls = Arc::new(AtomicUsize::new(0));
            let cleanups = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    answers,
                    polls: polls.clone(),
                    cleanups: cleanups.clone(),
                    fatal: false,
                },
                polls,
                cleanups,
            )
        }
    }

    #[async_trait]
    impl ReadinessCheck for Counted {
        fn label(&self) -> String {
            "counted".to_string()
        }

        async fn poll(&mut self) -> Result<bool> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                return Err(WaitError::CheckFailed {
                    check: self.label(),
                    reason: "broken".to_string(),
                });
            }
            Ok(self.answers.get(n).copied().unwrap_or(false))
        }

        async fn cleanup(&mut self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_times_out_and_cleans_up_once() {
        let (check, _, cleanups) = Counted::new(vec![]);
        let poller = ReadinessPoller::new(Duration::from_millis(20), Duration::from_millis(200))
            .with_check(check);

        let started = Instant::now();
        let err = poller.wait().await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout(), "{err}");
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(600));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        match err {
            WaitError::Timeout { pending, .. } => assert_eq!(pending, "counted"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_all_checks_must_pass() {
        let (first, first_polls, first_cleanups) = Counted::new(vec![true]);
        let (second, second_polls, second_cleanups) = Counted::new(vec![false, false, true]);
        let poller = ReadinessPoller::new(Duration::from_millis(5), Duration::from_secs(5))
            .with_check(first)
            .with_check(second);

        poller.wait().await.unwrap();

        // A passed check is not asked again.
        assert_eq!(first_polls.load(Ordering::SeqCst), 1);
        assert_eq!(second_polls.load(Ordering::SeqCst), 3);
        assert_eq!(first_cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(second_cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fatal_check_ends_wait() {
        let (mut check, polls, cleanups) = Counted::new(vec![]);
        check.fatal = true;
        let poller = ReadinessPoller::new(Duration::from_millis(5), Duration::from_secs(5))
            .with_check(check);

        let err = poller.wait().await.unwrap_err();
        assert!(matches!(err, WaitError::CheckFailed { .. }));
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_wait() {
        let (check, _, cleanups) = Counted::new(vec![]);
        let cancel = CancellationToken::new();
        let poller = ReadinessPoller::new(Duration::from_millis(5), Duration::from_secs(30))
            .with_check(check)
            .with_cancel(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = poller.wait().await.unwrap_err();
        assert!(matches!(err, WaitError::Cancelled { .. }));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_min_idle_without_checks() {
        let poller = ReadinessPoller::default().with_min_idle(Duration::from_millis(30));
        assert!(!poller.is_empty());
        let elapsed = poller.wait().await.unwrap();
        assert!(elapsed >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_empty_poller_is_satisfied_immediately() {
        let poller = ReadinessPoller::default();
        assert!(poller.is_empty());
        let elapsed = poller.wait().await.unwrap();
        assert!(elapsed < Duration::from_millis(100));
    }
}
