//! Response-time trend analysis and closed-loop tuning.
//!
//! The controller is plain state mutated by a single call site after every
//! completed request. It never touches the limiter or the router itself; it
//! returns [`AdaptiveAction`]s that the orchestrator applies.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Direction of recent latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    #[default]
    Stable,
    Degrading,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub window: usize,
    /// Samples averaged into the immutable baseline.
    pub baseline_samples: usize,
    /// Recent average at or above `baseline * regression_threshold` counts as
    /// degrading regardless of the short-window change.
    pub regression_threshold: f64,
    pub min_samples_for_adjustment: usize,
    pub confidence_threshold: f64,
    #[serde(with = "crate::config::duration_ms")]
    pub nominal_timeout: Duration,
    pub max_concurrency: usize,
    pub max_reductions: u32,
    pub max_endpoint_switches: u32,
    pub decay_interval: u64,
    /// Samples to wait between two adjustments.
    pub cooldown_samples: u64,
    pub elevated_error_rate: f64,
    #[serde(with = "crate::config::duration_ms")]
    pub bot_block_memory: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            window: 30,
            baseline_samples: 10,
            regression_threshold: 1.5,
            min_samples_for_adjustment: 15,
            confidence_threshold: 0.7,
            nominal_timeout: Duration::from_secs(15),
            max_concurrency: 3,
            max_reductions: 3,
            max_endpoint_switches: 2,
            decay_interval: 50,
            cooldown_samples: 5,
            elevated_error_rate: 0.2,
            bot_block_memory: Duration::from_secs(300),
        }
    }
}

/// One completed request.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub latency: Duration,
    pub success: bool,
    /// Limiter bound at the time the outcome was recorded.
    pub current_concurrency: usize,
}

/// Adjustment requested by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptiveAction {
    ReduceConcurrency { from: usize, to: usize },
    RestoreConcurrency { from: usize, to: usize },
    IncreaseTimeout { to: Duration },
    SwitchEndpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseTimeStats {
    pub total_requests: u64,
    pub recent: Vec<Duration>,
    pub average: Option<Duration>,
    pub baseline: Option<Duration>,
    pub trend: Trend,
    pub confidence: f64,
    pub error_rate: f64,
    pub concurrency_reductions: u32,
    pub timeout_increases: u32,
    pub endpoint_switches: u32,
}

#[derive(Debug)]
pub struct AdaptiveController {
    config: AdaptiveConfig,
    total_requests: u64,
    latencies: VecDeque<f64>,
    outcomes: VecDeque<bool>,
    baseline: Option<f64>,
    trend: Trend,
    confidence: f64,
    reductions: u32,
    timeout_increases: u32,
    switches: u32,
    last_adjustment_at: Option<u64>,
    last_bot_block: Option<Instant>,
}

impl Default for AdaptiveController {
    fn default() -> Self {
        Self::new(AdaptiveConfig::default())
    }
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig) -> Self {
        let window = config.window.max(4);
        Self {
            config: AdaptiveConfig { window, ..config },
            total_requests: 0,
            latencies: VecDeque::with_capacity(window),
            outcomes: VecDeque::with_capacity(window),
            baseline: None,
            trend: Trend::Stable,
            confidence: 0.0,
            reductions: 0,
            timeout_increases: 0,
            switches: 0,
            last_adjustment_at: None,
            last_bot_block: None,
        }
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    pub fn trend(&self) -> (Trend, f64) {
        (self.trend, self.confidence)
    }

    /// Record a completed request and return the adjustments it triggers.
    pub fn record_outcome(&mut self, observation: Observation) -> Vec<AdaptiveAction> {
        self.total_requests += 1;
        if self.latencies.len() == self.config.window {
            self.latencies.pop_front();
            self.outcomes.pop_front();
        }
        self.latencies.push_back(observation.latency.as_secs_f64());
        self.outcomes.push_back(observation.success);

        if self.baseline.is_none() && self.latencies.len() >= self.config.baseline_samples {
            let first = &self.latencies.make_contiguous()[..self.config.baseline_samples];
            self.baseline = Some(mean(first));
            log::debug!("latency baseline fixed at {:.3}s", self.baseline.unwrap_or_default());
        }

        if self.latencies.len() >= self.config.baseline_samples.max(2) {
            let (trend, confidence) = self.classify();
            self.trend = trend;
            self.confidence = confidence;
        }

        if self.config.decay_interval > 0 && self.total_requests % self.config.decay_interval == 0 {
            self.reductions = self.reductions.saturating_sub(1);
            self.timeout_increases = self.timeout_increases.saturating_sub(1);
            self.switches = self.switches.saturating_sub(1);
        }

        self.adjust(observation.current_concurrency)
    }

    fn classify(&mut self) -> (Trend, f64) {
        let samples = self.latencies.make_contiguous();
        let n = samples.len();
        let half = (n / 2).min(10);
        if half == 0 {
            return (Trend::Stable, 0.0);
        }
        let recent = &samples[n - half..];
        let previous = &samples[n - 2 * half..n - half];

        let recent_avg = mean(recent);
        let previous_avg = mean(previous);
        let change = if previous_avg > 0.0 {
            (recent_avg - previous_avg) / previous_avg
        } else {
            0.0
        };
        let cv = if recent_avg > 0.0 {
            std_dev(recent, recent_avg) / recent_avg
        } else {
            0.0
        };
        let inverse_variance = 1.0 / (1.0 + cv);

        let regression = self
            .baseline
            .filter(|baseline| *baseline > 0.0)
            .map(|baseline| recent_avg / baseline)
            .unwrap_or(0.0);
        let excess = (regression - 1.0).max(0.0);

        let trend = if change >= 0.20 || regression >= self.config.regression_threshold {
            Trend::Degrading
        } else if change <= -0.15 && cv < 0.3 {
            Trend::Improving
        } else {
            Trend::Stable
        };

        let confidence = match trend {
            Trend::Stable => (change.abs() / 0.2).min(1.0) * 0.5 * inverse_variance,
            Trend::Degrading => {
                let magnitude = (change.abs().max(excess) / 0.5).min(1.0);
                0.6 * magnitude + 0.4 * inverse_variance
            }
            Trend::Improving => {
                let magnitude = (change.abs() / 0.5).min(1.0);
                0.6 * magnitude + 0.4 * inverse_variance
            }
        };

        (trend, confidence.clamp(0.0, 1.0))
    }

    fn adjust(&mut self, current: usize) -> Vec<AdaptiveAction> {
        let mut actions = Vec::new();
        if self.latencies.len() < self.config.min_samples_for_adjustment
            || self.confidence < self.config.confidence_threshold
        {
            return actions;
        }
        if let Some(last) = self.last_adjustment_at
            && self.total_requests - last < self.config.cooldown_samples
        {
            return actions;
        }

        match self.trend {
            Trend::Degrading => {
                if self.reductions < self.config.max_reductions && current > 1 {
                    let step = (current / 4).max(1);
                    let to = current.saturating_sub(step).max(1);
                    self.reductions += 1;
                    log::info!("latency degrading: concurrency {current} -> {to}");
                    actions.push(AdaptiveAction::ReduceConcurrency { from: current, to });
                }

                self.timeout_increases += 1;
                actions.push(AdaptiveAction::IncreaseTimeout {
                    to: self.adaptive_timeout(),
                });

                let average = mean(self.latencies.make_contiguous());
                if average > self.config.nominal_timeout.as_secs_f64() * 0.6
                    && self.error_rate() >= self.config.elevated_error_rate
                    && self.switches < self.config.max_endpoint_switches
                {
                    self.switches += 1;
                    log::info!("latency degrading with {:.0}% errors: switching endpoint", self.error_rate() * 100.0);
                    actions.push(AdaptiveAction::SwitchEndpoint);
                }
            }
            Trend::Improving if self.confidence > 0.8 => {
                if current < self.config.max_concurrency {
                    self.reductions = self.reductions.saturating_sub(1);
                    log::info!("latency improving: concurrency {current} -> {}", current + 1);
                    actions.push(AdaptiveAction::RestoreConcurrency {
                        from: current,
                        to: current + 1,
                    });
                }
            }
            _ => {}
        }

        if !actions.is_empty() {
            self.last_adjustment_at = Some(self.total_requests);
        }
        actions
    }

    pub fn record_bot_block(&mut self) {
        self.record_bot_block_at(Instant::now());
    }

    pub fn record_bot_block_at(&mut self, at: Instant) {
        self.last_bot_block = Some(at);
    }

    pub fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.outcomes.iter().filter(|ok| !**ok).count() as f64 / self.outcomes.len() as f64
    }

    /// Timeout to use for the next request.
    pub fn adaptive_timeout(&self) -> Duration {
        self.adaptive_timeout_at(Instant::now())
    }

    pub fn adaptive_timeout_at(&self, now: Instant) -> Duration {
        let nominal = self.config.nominal_timeout.as_secs_f64();
        let average = if self.latencies.is_empty() {
            nominal
        } else {
            self.latencies.iter().sum::<f64>() / self.latencies.len() as f64
        };

        let mut timeout = (average * 2.2).max(nominal * 0.7);
        timeout *= match self.trend {
            Trend::Degrading => 1.3,
            Trend::Improving => 0.7,
            Trend::Stable => 1.0,
        };

        let error_rate = self.error_rate();
        if error_rate > 0.3 {
            timeout *= 1.4;
        } else if !self.outcomes.is_empty() && error_rate < 0.05 {
            timeout *= 0.9;
        }

        if let Some(blocked_at) = self.last_bot_block
            && now.saturating_duration_since(blocked_at) <= self.config.bot_block_memory
        {
            timeout *= 1.2;
        }

        Duration::from_secs_f64(timeout.min(nominal * 2.2))
    }

    pub fn stats(&self) -> ResponseTimeStats {
        let average = (!self.latencies.is_empty()).then(|| {
            Duration::from_secs_f64(self.latencies.iter().sum::<f64>() / self.latencies.len() as f64)
        });
        ResponseTimeStats {
            total_requests: self.total_requests,
            recent: self.latencies.iter().map(|s| Duration::from_secs_f64(*s)).collect(),
            average,
            baseline: self.baseline.map(Duration::from_secs_f64),
            trend: self.trend,
            confidence: self.confidence,
            error_rate: self.error_rate(),
            concurrency_reductions: self.reductions,
            timeout_increases: self.timeout_increases,
            endpoint_switches: self.switches,
        }
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

fn std_dev(samples: &[f64], mean: f64) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    variance.sqrt()
}
