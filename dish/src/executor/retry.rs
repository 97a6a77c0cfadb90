//! Retry controller for submission units.
//!
//! A unit is submitted, polled to a terminal state, and re-submitted on
//! failure until the retry budget is spent. Every attempt is a fresh
//! submission; only the expanded command carries over.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::submission::{SubmissionUnit, UnitOutcome};
use super::throttle::StageLimiter;
use crate::backend::{ClusterBackend, SubmissionHandle, SubmissionState};
use crate::cancellation::CancellationToken;
use crate::events::EventSink;

/// Backoff strategy for delays between re-submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter strategy to spread re-submissions out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
}

/// Delay policy applied between attempts.
///
/// How many attempts are made is decided by the retry budget, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay between attempts in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

fn default_base_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Full,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with no delay between attempts.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            backoff: BackoffStrategy::Constant,
            jitter: JitterStrategy::None,
        }
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Calculates the delay before re-submission number `retry` (0-indexed).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;

        let delay = match self.backoff {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retry)).min(max),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Result of a single submission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Attempt {
    Succeeded,
    Failed { exit_status: Option<i32>, reason: String },
    Cancelled(String),
}

/// Drives submission units through submit/poll/retry.
pub struct RetryController {
    backend: Arc<dyn ClusterBackend>,
    queue: String,
    retries: u32,
    policy: RetryPolicy,
    poll_interval: Duration,
    limiter: StageLimiter,
    cancel_token: Arc<CancellationToken>,
    events: Arc<dyn EventSink>,
}

impl RetryController {
    /// Creates a controller for one stage.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        backend: Arc<dyn ClusterBackend>,
        queue: impl Into<String>,
        retries: u32,
        policy: RetryPolicy,
        poll_interval: Duration,
        limiter: StageLimiter,
        cancel_token: Arc<CancellationToken>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            backend,
            queue: queue.into(),
            retries,
            policy,
            poll_interval,
            limiter,
            cancel_token,
            events,
        }
    }

    /// Returns the retry budget.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Runs a unit to a terminal outcome, retrying failures.
    ///
    /// Makes at most `1 + retries` submissions.
    pub async fn run(&self, mut unit: SubmissionUnit) -> UnitOutcome {
        let mut exit_statuses = Vec::new();

        let last_reason = loop {
            if let Some(reason) = self.cancel_token.reason() {
                return UnitOutcome::cancelled(unit.attempt.saturating_sub(1), exit_statuses, reason);
            }

            let last_reason = match self.attempt(&unit).await {
                Attempt::Succeeded => {
                    return UnitOutcome::succeeded(unit.attempt, exit_statuses);
                }
                Attempt::Cancelled(reason) => {
                    return UnitOutcome::cancelled(unit.attempt, exit_statuses, reason);
                }
                Attempt::Failed { exit_status, reason } => {
                    exit_statuses.push(exit_status);
                    reason
                }
            };

            let retry = unit.attempt - 1;
            if retry >= self.retries {
                break last_reason;
            }

            let delay = self.policy.delay_for(retry);
            warn!(
                job = %unit.job,
                stage = %unit.stage,
                attempt = unit.attempt,
                reason = %last_reason,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Re-submitting failed unit"
            );
            self.events.try_emit(
                "job.retry",
                Some(serde_json::json!({
                    "job": &unit.job,
                    "stage": &unit.stage,
                    "attempt": unit.attempt,
                    "reason": &last_reason,
                })),
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel_token.cancelled() => {}
            }

            unit = unit.next_attempt();
        };

        UnitOutcome::failed(unit.attempt, exit_statuses, last_reason)
    }

    async fn attempt(&self, unit: &SubmissionUnit) -> Attempt {
        let permit = tokio::select! {
            permit = self.limiter.acquire() => permit,
            () = self.cancel_token.cancelled() => {
                return Attempt::Cancelled(self.cancel_reason());
            }
        };
        let Ok(_permit) = permit else {
            return Attempt::Failed {
                exit_status: None,
                reason: "concurrency limiter closed".to_string(),
            };
        };

        let handle = match self.backend.submit(unit, &self.queue).await {
            Ok(handle) => handle,
            Err(e) => {
                return Attempt::Failed {
                    exit_status: None,
                    reason: e.to_string(),
                };
            }
        };

        debug!(
            job = %unit.job,
            stage = %unit.stage,
            attempt = unit.attempt,
            handle = %handle,
            in_flight = self.limiter.in_flight(),
            "Submitted unit"
        );

        loop {
            match self.backend.poll(&handle).await {
                Ok(SubmissionState::Queued | SubmissionState::Running) => {}
                Ok(SubmissionState::Succeeded) => return Attempt::Succeeded,
                Ok(SubmissionState::Failed { exit_status }) => {
                    return Attempt::Failed {
                        exit_status: Some(exit_status),
                        reason: format!("command exited with status {exit_status}"),
                    };
                }
                Err(e) => {
                    self.cancel_quietly(&handle).await;
                    return Attempt::Failed {
                        exit_status: None,
                        reason: e.to_string(),
                    };
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                () = self.cancel_token.cancelled() => {
                    self.cancel_quietly(&handle).await;
                    return Attempt::Cancelled(self.cancel_reason());
                }
            }
        }
    }

    async fn cancel_quietly(&self, handle: &SubmissionHandle) {
        if let Err(e) = self.backend.cancel(handle).await {
            warn!(handle = %handle, error = %e, "Failed to cancel submission");
        }
    }

    fn cancel_reason(&self) -> String {
        self.cancel_token.reason().unwrap_or_else(|| "cancelled".to_string())
    }
}

impl std::fmt::Debug for RetryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("backend", &self.backend.name())
            .field("queue", &self.queue)
            .field("retries", &self.retries)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockClusterBackend;
    use crate::errors::BackendError;
    use crate::events::NoOpEventSink;
    use crate::executor::submission::{ResourceRequest, UnitStatus};
    use crate::executor::throttle::Throttle;
    use crate::testing::ScriptedBackend;
    use std::path::PathBuf;

    fn unit(job: &str) -> SubmissionUnit {
        SubmissionUnit::new(job, "run[0]", "false", ResourceRequest::default(), PathBuf::from("/tmp"))
    }

    fn controller(backend: Arc<dyn ClusterBackend>, retries: u32, token: Arc<CancellationToken>) -> RetryController {
        RetryController::new(
            backend,
            "batch",
            retries,
            RetryPolicy::immediate(),
            Duration::from_millis(1),
            Throttle::new(4).limiter(4),
            token,
            Arc::new(NoOpEventSink),
        )
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff, BackoffStrategy::Exponential);
        assert_eq!(policy.jitter, JitterStrategy::Full);
    }

    #[test]
    fn test_delay_exponential_no_jitter() {
        let policy = RetryPolicy::default()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::None);

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_linear_and_constant() {
        let linear = RetryPolicy::default()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear)
            .with_jitter(JitterStrategy::None);
        assert_eq!(linear.delay_for(2), Duration::from_millis(300));

        let constant = linear.with_backoff(BackoffStrategy::Constant);
        assert_eq!(constant.delay_for(5), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::default()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000)
            .with_jitter(JitterStrategy::None);
        assert_eq!(policy.delay_for(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_delay_full_jitter_bounded() {
        let policy = RetryPolicy::default()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        for _ in 0..10 {
            assert!(policy.delay_for(0) <= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_always_failing_unit_uses_full_budget() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("s1", [1, 1, 1, 1]);

        let ctl = controller(backend.clone(), 2, Arc::new(CancellationToken::new()));
        let outcome = ctl.run(unit("s1")).await;

        assert_eq!(outcome.status, UnitStatus::Failed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.last_exit_status(), Some(1));
        assert_eq!(backend.submissions("s1"), 3);
    }

    #[tokio::test]
    async fn test_failure_reports_last_attempt_reason() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("s1", [1, 2]);

        let ctl = controller(backend.clone(), 1, Arc::new(CancellationToken::new()));
        let outcome = ctl.run(unit("s1")).await;

        assert_eq!(outcome.status, UnitStatus::Failed);
        assert_eq!(outcome.reason.as_deref(), Some("command exited with status 2"));
        assert_eq!(outcome.last_exit_status(), Some(2));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("s1", [137, 0]);

        let ctl = controller(backend.clone(), 3, Arc::new(CancellationToken::new()));
        let outcome = ctl.run(unit("s1")).await;

        assert_eq!(outcome.status, UnitStatus::Succeeded);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.exit_statuses, vec![Some(137)]);
    }

    #[tokio::test]
    async fn test_zero_retries_single_attempt() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("s1", [2]);

        let ctl = controller(backend.clone(), 0, Arc::new(CancellationToken::new()));
        let outcome = ctl.run(unit("s1")).await;

        assert_eq!(outcome.status, UnitStatus::Failed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(backend.submissions("s1"), 1);
    }

    #[tokio::test]
    async fn test_backend_fault_consumes_retry_budget() {
        let mut mock = MockClusterBackend::new();
        mock.expect_name().return_const("mock");
        mock.expect_submit()
            .times(2)
            .returning(|_, _| Err(BackendError::SubmitRejected("node down".to_string())));

        let ctl = controller(Arc::new(mock), 1, Arc::new(CancellationToken::new()));
        let outcome = ctl.run(unit("s1")).await;

        assert_eq!(outcome.status, UnitStatus::Failed);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.last_exit_status(), None);
        assert!(outcome.reason.unwrap().contains("node down"));
    }

    #[tokio::test]
    async fn test_poll_fault_cancels_handle() {
        let mut mock = MockClusterBackend::new();
        mock.expect_name().return_const("mock");
        mock.expect_submit()
            .times(1)
            .returning(|_, _| Ok(SubmissionHandle::new("7.torque")));
        mock.expect_poll().times(1).returning(|h| {
            Err(BackendError::PollFailed {
                handle: h.to_string(),
                reason: "qstat timed out".to_string(),
            })
        });
        mock.expect_cancel().times(1).returning(|_| Ok(()));

        let ctl = controller(Arc::new(mock), 0, Arc::new(CancellationToken::new()));
        let outcome = ctl.run(unit("s1")).await;

        assert_eq!(outcome.status, UnitStatus::Failed);
        assert!(outcome.reason.unwrap().contains("qstat timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_before_submission() {
        let backend = Arc::new(ScriptedBackend::new());
        let token = Arc::new(CancellationToken::new());
        token.cancel("operator abort");

        let ctl = controller(backend.clone(), 2, token);
        let outcome = ctl.run(unit("s1")).await;

        assert_eq!(outcome.status, UnitStatus::Cancelled);
        assert_eq!(backend.submissions("s1"), 0);
        assert_eq!(outcome.reason.as_deref(), Some("operator abort"));
    }
}
