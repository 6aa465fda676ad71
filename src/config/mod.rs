//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - Defaults tuned for the DuckDuckGo HTML front-ends
//! - JSON loading (string or file)
//! - Validation before the orchestrator is built

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::browser::{BrowserPoolConfig, ProcessBackendConfig};
use crate::detection::DetectionConfig;
use crate::modules::adaptive::AdaptiveConfig;
use crate::modules::concurrency::LimiterConfig;
use crate::modules::endpoints::Endpoint;
use crate::modules::retry::RetryConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid endpoint '{name}': {reason}")]
    InvalidEndpoint { name: String, reason: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Defaults applied to searches and batches.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SearchDefaults {
    /// Pacing between queries of a batch.
    #[serde(with = "duration_ms")]
    pub query_delay: Duration,
    /// Upper bound on `SearchOptions::count`; one backend page.
    pub max_results: usize,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self {
            query_delay: Duration::from_secs(1),
            max_results: 30,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub endpoints: Vec<Endpoint>,
    pub limiter: LimiterConfig,
    pub adaptive: AdaptiveConfig,
    pub retry: RetryConfig,
    pub browser: BrowserPoolConfig,
    pub engine: ProcessBackendConfig,
    pub detection: DetectionConfig,
    pub search: SearchDefaults,
    pub enable_metrics: bool,
    pub enable_adaptive_control: bool,
    pub enable_browser_fallback: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            limiter: LimiterConfig::default(),
            adaptive: AdaptiveConfig::default(),
            retry: RetryConfig::default(),
            browser: BrowserPoolConfig::default(),
            engine: ProcessBackendConfig::default(),
            detection: DetectionConfig::default(),
            search: SearchDefaults::default(),
            enable_metrics: true,
            enable_adaptive_control: true,
            enable_browser_fallback: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Nominal per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.adaptive.nominal_timeout
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::Invalid("at least one endpoint is required".into()));
        }
        for endpoint in &self.endpoints {
            if !matches!(endpoint.url.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidEndpoint {
                    name: endpoint.name.clone(),
                    reason: format!("unsupported scheme '{}'", endpoint.url.scheme()),
                });
            }
        }
        if self.limiter.max_concurrency == 0 {
            return Err(ConfigError::Invalid("limiter.max_concurrency must be at least 1".into()));
        }
        if self.browser.max_tabs == 0 {
            return Err(ConfigError::Invalid("browser.max_tabs must be at least 1".into()));
        }
        if self.browser.prewarm_tabs > self.browser.max_tabs {
            return Err(ConfigError::Invalid(
                "browser.prewarm_tabs cannot exceed browser.max_tabs".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.adaptive.nominal_timeout.is_zero() {
            return Err(ConfigError::Invalid("adaptive.nominal_timeout must be positive".into()));
        }
        if !(1..=100).contains(&self.detection.threshold) {
            return Err(ConfigError::Invalid("detection.threshold must be within 1..=100".into()));
        }
        if self.search.max_results == 0 {
            return Err(ConfigError::Invalid("search.max_results must be at least 1".into()));
        }
        Ok(())
    }
}

/// DuckDuckGo HTML, Lite and legacy HTML front-ends, in that order.
pub fn default_endpoints() -> Vec<Endpoint> {
    [
        ("html", "https://html.duckduckgo.com/html/"),
        ("lite", "https://lite.duckduckgo.com/lite/"),
        ("legacy", "https://duckduckgo.com/html/"),
    ]
    .into_iter()
    .filter_map(|(name, raw)| Endpoint::parse(name, raw).ok())
    .collect()
}

/// Durations as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
