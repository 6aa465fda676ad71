//! Error taxonomy surfaced by the orchestration layer.

use std::time::Duration;

use thiserror::Error;

use crate::browser::BrowserError;
use crate::config::ConfigError;

/// Result alias used across the orchestration layer.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Coarse failure classes used by the retry classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Captcha,
    RateLimited,
    Timeout,
    EarlyTimeout,
    ClientError,
    BrowserUnavailable,
    Terminal,
    Other,
}

/// High-level error surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("rate limited by {endpoint}")]
    RateLimited {
        endpoint: String,
        retry_after: Option<Duration>,
    },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed after {elapsed:?} before any response: {message}")]
    EarlyTimeout { elapsed: Duration, message: String },
    #[error("captcha challenge detected at {url} (confidence {confidence})")]
    CaptchaDetected { url: String, confidence: u8 },
    #[error("request blocked at {url}: {reason}")]
    Blocked { url: String, reason: String },
    #[error("all {attempted} endpoint(s) failed")]
    AllEndpointsFailed { attempted: usize },
    #[error("browser unavailable: {0}")]
    BrowserUnavailable(String),
    #[error("browser error: {0}")]
    Browser(BrowserError),
    #[error("failed to parse backend response: {0}")]
    Parse(String),
    #[error("client error: HTTP {status} from {url}")]
    ClientError { status: u16, url: String },
    #[error("server error: HTTP {status} from {url}")]
    ServerError { status: u16, url: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("task '{0}' was cancelled")]
    Cancelled(String),
    #[error("{source} (after {attempts} attempt(s))")]
    Failed {
        attempts: u32,
        #[source]
        source: Box<OrchestratorError>,
    },
}

impl OrchestratorError {
    /// Classify the error for retry decisions. Annotated errors classify as
    /// their innermost cause.
    pub fn kind(&self) -> FailureKind {
        match self {
            OrchestratorError::CaptchaDetected { .. } => FailureKind::Captcha,
            OrchestratorError::RateLimited { .. } => FailureKind::RateLimited,
            OrchestratorError::Timeout(_) => FailureKind::Timeout,
            OrchestratorError::EarlyTimeout { .. } => FailureKind::EarlyTimeout,
            OrchestratorError::ClientError { .. } => FailureKind::ClientError,
            OrchestratorError::BrowserUnavailable(_) => FailureKind::BrowserUnavailable,
            OrchestratorError::AllEndpointsFailed { .. }
            | OrchestratorError::Url(_)
            | OrchestratorError::Config(_)
            | OrchestratorError::Cancelled(_) => FailureKind::Terminal,
            OrchestratorError::Http(err) if err.is_timeout() => FailureKind::Timeout,
            OrchestratorError::Failed { source, .. } => source.kind(),
            _ => FailureKind::Other,
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind(),
            FailureKind::ClientError | FailureKind::BrowserUnavailable | FailureKind::Terminal
        )
    }

    /// Whether the failure says something about the endpoint that served it,
    /// so the next attempt should go elsewhere.
    pub fn warrants_failover(&self) -> bool {
        match self.root() {
            OrchestratorError::ServerError { .. } | OrchestratorError::Blocked { .. } => true,
            other => matches!(
                other.kind(),
                FailureKind::Captcha
                    | FailureKind::RateLimited
                    | FailureKind::Timeout
                    | FailureKind::EarlyTimeout
            ),
        }
    }

    /// Server-suggested wait for rate limit errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self.root() {
            OrchestratorError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Number of attempts recorded on an annotated error.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            OrchestratorError::Failed { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Innermost error, skipping attempt annotations.
    pub fn root(&self) -> &OrchestratorError {
        match self {
            OrchestratorError::Failed { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn with_attempts(self, attempts: u32) -> Self {
        match self {
            OrchestratorError::Failed { source, .. } => OrchestratorError::Failed {
                attempts,
                source,
            },
            other => OrchestratorError::Failed {
                attempts,
                source: Box::new(other),
            },
        }
    }
}

impl From<BrowserError> for OrchestratorError {
    fn from(err: BrowserError) -> Self {
        match err {
            BrowserError::Launch(message) => OrchestratorError::BrowserUnavailable(message),
            BrowserError::Disconnected => {
                OrchestratorError::BrowserUnavailable("automation engine disconnected".into())
            }
            BrowserError::WorkerTimeout(elapsed) => OrchestratorError::Timeout(elapsed),
            other => OrchestratorError::Browser(other),
        }
    }
}
