//! Retry orchestration around one logical operation.
//!
//! Per call the orchestrator walks `Init -> Attempt -> {Success, Classify}` and
//! `Classify -> {Backoff -> Attempt, EscalateBrowser -> Attempt, Fail}`. The
//! attempt closure decides how to honour [`AttemptMode::Browser`]; the
//! orchestrator only decides when to ask for it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::time::sleep;

use crate::core::error::{FailureKind, OrchestratorError, OrchestratorResult};
use crate::modules::events::{EscalationEvent, EventDispatcher, OrchestratorEvent, RetryEvent};

/// Transport used for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptMode {
    Plain,
    Browser,
}

/// Parameters handed to the attempt closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptContext {
    /// 1-based.
    pub attempt: u32,
    pub timeout: Duration,
    pub mode: AttemptMode,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Added to the timeout of every attempt after the first.
    #[serde(with = "crate::config::duration_ms")]
    pub timeout_increment: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub rate_limit_base: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub timeout_base: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub other_delay: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub max_backoff: Duration,
    /// Consecutive timeouts (across all calls) before backoff turns conservative.
    pub conservative_after: u32,
    pub conservative_multiplier: f64,
    /// Escalate captcha failures to the browser path once per call.
    pub browser_escalation: bool,
    /// Upper bound of the random jitter added to fixed delays.
    #[serde(with = "crate::config::duration_ms")]
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_increment: Duration::from_secs(5),
            rate_limit_base: Duration::from_secs(1),
            timeout_base: Duration::from_secs(1),
            other_delay: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            conservative_after: 3,
            conservative_multiplier: 3.0,
            browser_escalation: true,
            jitter: Duration::from_millis(250),
        }
    }
}

/// What happens after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Backoff(Duration),
    EscalateBrowser,
    /// Drop back to the starting mode and retry immediately.
    Revert,
    Fail,
}

/// Successful result plus bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
    pub mode: AttemptMode,
}

#[derive(Debug, Clone, Copy)]
struct CallState {
    start_mode: AttemptMode,
    mode: AttemptMode,
    escalated: bool,
    allow_escalation: bool,
}

pub struct RetryOrchestrator {
    config: RetryConfig,
    consecutive_timeouts: Arc<AtomicU32>,
    events: Option<Arc<EventDispatcher>>,
}

impl RetryOrchestrator {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            consecutive_timeouts: Arc::new(AtomicU32::new(0)),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Timeouts observed in a row across every call sharing this orchestrator.
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::Relaxed)
    }

    /// Run `operation` with retries. `label` names the operation in logs and
    /// events.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        initial_timeout: Duration,
        start_mode: AttemptMode,
        operation: F,
    ) -> OrchestratorResult<RetryOutcome<T>>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = OrchestratorResult<T>>,
    {
        self.run_with_escalation(
            label,
            initial_timeout,
            start_mode,
            self.config.browser_escalation,
            operation,
        )
        .await
    }

    /// Like [`run`](Self::run), with browser escalation switched per call.
    pub async fn run_with_escalation<T, F, Fut>(
        &self,
        label: &str,
        initial_timeout: Duration,
        start_mode: AttemptMode,
        allow_escalation: bool,
        mut operation: F,
    ) -> OrchestratorResult<RetryOutcome<T>>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = OrchestratorResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut state = CallState {
            start_mode,
            mode: start_mode,
            escalated: false,
            allow_escalation,
        };
        let mut attempt = 0;

        loop {
            attempt += 1;
            let context = AttemptContext {
                attempt,
                timeout: initial_timeout + self.config.timeout_increment * (attempt - 1),
                mode: state.mode,
            };
            log::debug!(
                "{label}: attempt {attempt}/{max_attempts} ({:?}, timeout {:?})",
                context.mode,
                context.timeout
            );

            let err = match operation(context).await {
                Ok(value) => {
                    self.consecutive_timeouts.store(0, Ordering::Relaxed);
                    return Ok(RetryOutcome {
                        value,
                        attempts: attempt,
                        mode: context.mode,
                    });
                }
                Err(err) => err,
            };

            if matches!(err.kind(), FailureKind::Timeout | FailureKind::EarlyTimeout) {
                self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed);
            } else {
                self.consecutive_timeouts.store(0, Ordering::Relaxed);
            }

            let decision = self.decide(&err, attempt, &state);
            if attempt >= max_attempts && decision != RetryDecision::Fail {
                log::warn!("{label}: giving up after {attempt} attempt(s): {err}");
                return Err(err.with_attempts(attempt));
            }

            match decision {
                RetryDecision::Fail => {
                    log::warn!("{label}: not retrying after attempt {attempt}: {err}");
                    return Err(err.with_attempts(attempt));
                }
                RetryDecision::EscalateBrowser => {
                    log::info!("{label}: {err}; escalating to browser");
                    state.escalated = true;
                    state.mode = AttemptMode::Browser;
                    self.dispatch(OrchestratorEvent::Escalation(EscalationEvent {
                        operation: label.to_string(),
                        reason: err.to_string(),
                        headed: false,
                        timestamp: chrono::Utc::now(),
                    }));
                }
                RetryDecision::Revert => {
                    log::warn!("{label}: browser escalation failed ({err}); continuing in {:?} mode", state.start_mode);
                    state.mode = state.start_mode;
                }
                RetryDecision::Backoff(delay) => {
                    if state.mode != state.start_mode {
                        log::warn!("{label}: browser escalation failed ({err}); continuing in {:?} mode", state.start_mode);
                        state.mode = state.start_mode;
                    }
                    log::warn!("{label}: attempt {attempt} failed ({err}); retrying in {delay:?}");
                    self.dispatch(OrchestratorEvent::Retry(RetryEvent {
                        operation: label.to_string(),
                        attempt: attempt + 1,
                        reason: err.to_string(),
                        scheduled_after: delay,
                        timestamp: chrono::Utc::now(),
                    }));
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }

    fn decide(&self, err: &OrchestratorError, attempt: u32, state: &CallState) -> RetryDecision {
        let escalation_failed = state.mode != state.start_mode;
        if escalation_failed && matches!(err.kind(), FailureKind::BrowserUnavailable) {
            return RetryDecision::Revert;
        }
        if !err.is_retryable() {
            return RetryDecision::Fail;
        }
        match err.kind() {
            FailureKind::Captcha
                if state.allow_escalation
                    && !state.escalated
                    && state.start_mode == AttemptMode::Plain =>
            {
                RetryDecision::EscalateBrowser
            }
            FailureKind::RateLimited => {
                let exponential = self.config.rate_limit_base.as_secs_f64()
                    * 2f64.powi(attempt.saturating_sub(1).min(16) as i32);
                let mut delay = Duration::from_secs_f64(exponential);
                if let Some(retry_after) = err.retry_after() {
                    delay = delay.max(retry_after);
                }
                RetryDecision::Backoff(delay.min(self.config.max_backoff))
            }
            FailureKind::Timeout | FailureKind::EarlyTimeout => {
                let mut delay = self.config.timeout_base * attempt;
                if self.consecutive_timeouts() >= self.config.conservative_after {
                    delay = delay.mul_f64(self.config.conservative_multiplier);
                    log::debug!("{} consecutive timeouts: conservative backoff", self.consecutive_timeouts());
                }
                RetryDecision::Backoff(delay.min(self.config.max_backoff))
            }
            _ => RetryDecision::Backoff(self.config.other_delay + self.jitter()),
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.config.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    fn dispatch(&self, event: OrchestratorEvent) {
        if let Some(events) = &self.events {
            events.dispatch(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn instant_config() -> RetryConfig {
        RetryConfig {
            rate_limit_base: Duration::ZERO,
            timeout_base: Duration::ZERO,
            other_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            ..RetryConfig::default()
        }
    }

    fn rate_limited() -> OrchestratorError {
        OrchestratorError::RateLimited {
            endpoint: "https://backend.example/".into(),
            retry_after: None,
        }
    }

    fn captcha() -> OrchestratorError {
        OrchestratorError::CaptchaDetected {
            url: "https://backend.example/".into(),
            confidence: 70,
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_with_growing_timeouts() {
        let retry = RetryOrchestrator::new(instant_config());
        let seen = Mutex::new(Vec::new());
        let outcome = retry
            .run("search", Duration::from_secs(10), AttemptMode::Plain, |ctx| {
                seen.lock().unwrap().push(ctx.timeout);
                async move {
                    if ctx.attempt < 3 {
                        Err(rate_limited())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome.value, "done");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Duration::from_secs(10),
                Duration::from_secs(15),
                Duration::from_secs(20)
            ]
        );
    }

    #[tokio::test]
    async fn client_errors_fail_immediately() {
        let retry = RetryOrchestrator::new(instant_config());
        let err = retry
            .run("search", Duration::from_secs(1), AttemptMode::Plain, |_| async {
                Err::<(), _>(OrchestratorError::ClientError {
                    status: 404,
                    url: "https://backend.example/".into(),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), Some(1));
        assert_eq!(err.kind(), FailureKind::ClientError);
    }

    #[tokio::test]
    async fn exhaustion_reports_last_error_and_attempts() {
        let retry = RetryOrchestrator::new(instant_config());
        let err = retry
            .run("search", Duration::from_secs(1), AttemptMode::Plain, |_| async {
                Err::<(), _>(OrchestratorError::Timeout(Duration::from_secs(1)))
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert!(retry.consecutive_timeouts() >= 3);
    }

    #[tokio::test]
    async fn captcha_escalates_to_browser_once() {
        let retry = RetryOrchestrator::new(instant_config());
        let modes = Mutex::new(Vec::new());
        let outcome = retry
            .run("fetch", Duration::from_secs(1), AttemptMode::Plain, |ctx| {
                modes.lock().unwrap().push(ctx.mode);
                async move {
                    match ctx.mode {
                        AttemptMode::Plain => Err(captcha()),
                        AttemptMode::Browser => Ok(ctx.attempt),
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome.mode, AttemptMode::Browser);
        assert_eq!(*modes.lock().unwrap(), vec![AttemptMode::Plain, AttemptMode::Browser]);
    }

    #[tokio::test]
    async fn failed_escalation_reverts_to_plain_mode() {
        let retry = RetryOrchestrator::new(instant_config());
        let modes = Mutex::new(Vec::new());
        let outcome = retry
            .run("fetch", Duration::from_secs(1), AttemptMode::Plain, |ctx| {
                modes.lock().unwrap().push(ctx.mode);
                async move {
                    match (ctx.mode, ctx.attempt) {
                        (AttemptMode::Plain, 1) => Err(captcha()),
                        (AttemptMode::Browser, _) => {
                            Err(OrchestratorError::BrowserUnavailable("no engine".into()))
                        }
                        _ => Ok(()),
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            *modes.lock().unwrap(),
            vec![AttemptMode::Plain, AttemptMode::Browser, AttemptMode::Plain]
        );
    }

    #[tokio::test]
    async fn browser_unavailable_fails_fast_when_browser_was_requested() {
        let retry = RetryOrchestrator::new(instant_config());
        let err = retry
            .run("fetch", Duration::from_secs(1), AttemptMode::Browser, |_| async {
                Err::<(), _>(OrchestratorError::BrowserUnavailable("no engine".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), Some(1));
    }

    #[test]
    fn rate_limit_backoff_is_exponential_and_honours_retry_after() {
        let retry = RetryOrchestrator::new(RetryConfig::default());
        let state = CallState {
            start_mode: AttemptMode::Plain,
            mode: AttemptMode::Plain,
            escalated: false,
            allow_escalation: true,
        };
        assert_eq!(
            retry.decide(&rate_limited(), 1, &state),
            RetryDecision::Backoff(Duration::from_secs(1))
        );
        assert_eq!(
            retry.decide(&rate_limited(), 3, &state),
            RetryDecision::Backoff(Duration::from_secs(4))
        );
        let hinted = OrchestratorError::RateLimited {
            endpoint: "https://backend.example/".into(),
            retry_after: Some(Duration::from_secs(90)),
        };
        assert_eq!(
            retry.decide(&hinted, 1, &state),
            RetryDecision::Backoff(Duration::from_secs(30))
        );
    }

    #[test]
    fn saturated_retry_after_is_capped_at_max_backoff() {
        let retry = RetryOrchestrator::new(RetryConfig::default());
        let state = CallState {
            start_mode: AttemptMode::Plain,
            mode: AttemptMode::Plain,
            escalated: false,
            allow_escalation: true,
        };
        let hinted = OrchestratorError::RateLimited {
            endpoint: "https://backend.example/".into(),
            retry_after: Some(Duration::MAX),
        };
        assert_eq!(
            retry.decide(&hinted, 3, &state),
            RetryDecision::Backoff(RetryConfig::default().max_backoff)
        );
    }

    #[tokio::test]
    async fn other_failures_break_a_timeout_streak() {
        let retry = RetryOrchestrator::new(instant_config());
        let calls = AtomicU32::new(0);
        let err = retry
            .run("search", Duration::from_secs(1), AttemptMode::Plain, |_| {
                let call = calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    Err::<(), _>(match call {
                        1 => OrchestratorError::ServerError {
                            status: 503,
                            url: "https://backend.example/".into(),
                        },
                        _ => OrchestratorError::Timeout(Duration::from_secs(1)),
                    })
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(retry.consecutive_timeouts(), 1);
    }

    #[test]
    fn timeouts_turn_conservative_after_a_streak() {
        let retry = RetryOrchestrator::new(RetryConfig::default());
        let state = CallState {
            start_mode: AttemptMode::Plain,
            mode: AttemptMode::Plain,
            escalated: false,
            allow_escalation: true,
        };
        let timeout = OrchestratorError::Timeout(Duration::from_secs(15));
        assert_eq!(
            retry.decide(&timeout, 2, &state),
            RetryDecision::Backoff(Duration::from_secs(2))
        );
        retry.consecutive_timeouts.store(3, Ordering::Relaxed);
        assert_eq!(
            retry.decide(&timeout, 2, &state),
            RetryDecision::Backoff(Duration::from_secs(6))
        );
    }

    #[tokio::test]
    async fn captcha_without_escalation_retries_in_plain_mode() {
        let retry = RetryOrchestrator::new(instant_config());
        let modes = Mutex::new(Vec::new());
        let err = retry
            .run_with_escalation("fetch", Duration::from_secs(1), AttemptMode::Plain, false, |ctx| {
                modes.lock().unwrap().push(ctx.mode);
                async { Err::<(), _>(captcha()) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Captcha);
        assert_eq!(*modes.lock().unwrap(), vec![AttemptMode::Plain; 3]);
    }
}
