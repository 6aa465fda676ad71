//! Per-endpoint attempt accounting.
//!
//! Every attempt the orchestrator makes lands here exactly once, already
//! classified: a 200 that carried a block page is a [`AttemptOutcome::Blocked`],
//! never a success. Latency windows are kept per endpoint and summarised only
//! when a snapshot is taken.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEFAULT_WINDOW: usize = 128;

/// How a single attempt against an endpoint ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptOutcome {
    Success,
    /// A response whose body scored as a block or challenge page.
    Blocked,
    /// HTTP 429.
    RateLimited,
    ClientError,
    ServerError,
    /// No usable response: timeouts, refused connections, worker crashes.
    Transport,
}

impl AttemptOutcome {
    pub fn is_success(self) -> bool {
        self == AttemptOutcome::Success
    }
}

/// Tally of attempt outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub attempts: u64,
    pub successes: u64,
    pub blocks: u64,
    pub rate_limited: u64,
    pub client_errors: u64,
    pub server_errors: u64,
    pub transport_errors: u64,
}

impl OutcomeCounts {
    fn add(&mut self, outcome: AttemptOutcome) {
        self.attempts += 1;
        let bucket = match outcome {
            AttemptOutcome::Success => &mut self.successes,
            AttemptOutcome::Blocked => &mut self.blocks,
            AttemptOutcome::RateLimited => &mut self.rate_limited,
            AttemptOutcome::ClientError => &mut self.client_errors,
            AttemptOutcome::ServerError => &mut self.server_errors,
            AttemptOutcome::Transport => &mut self.transport_errors,
        };
        *bucket += 1;
    }

    fn merge(&mut self, other: &OutcomeCounts) {
        self.attempts += other.attempts;
        self.successes += other.successes;
        self.blocks += other.blocks;
        self.rate_limited += other.rate_limited;
        self.client_errors += other.client_errors;
        self.server_errors += other.server_errors;
        self.transport_errors += other.transport_errors;
    }

    pub fn failures(&self) -> u64 {
        self.attempts - self.successes
    }

    /// `None` before the first attempt.
    pub fn success_rate(&self) -> Option<f64> {
        (self.attempts > 0).then(|| self.successes as f64 / self.attempts as f64)
    }
}

/// Latency summary over a window of samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySummary {
    pub average: Option<Duration>,
    pub p95: Option<Duration>,
}

impl LatencySummary {
    fn over(mut samples: Vec<Duration>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        Self {
            average: Some(samples.iter().sum::<Duration>() / samples.len() as u32),
            p95: percentile(&samples, 0.95),
        }
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[Duration], quantile: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let index = ((sorted.len() as f64 * quantile).ceil() as usize).saturating_sub(1);
    sorted.get(index.min(sorted.len() - 1)).copied()
}

#[derive(Debug, Clone)]
pub struct EndpointStats {
    pub endpoint: String,
    pub counts: OutcomeCounts,
    pub latency: LatencySummary,
    /// Non-successful attempts since the last success.
    pub failure_streak: u32,
    pub last_outcome: Option<AttemptOutcome>,
    /// Status of the last attempt that produced a response.
    pub last_status: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub counts: OutcomeCounts,
    pub latency: LatencySummary,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    /// Sorted by endpoint name.
    pub endpoints: Vec<EndpointStats>,
}

impl MetricsSnapshot {
    pub fn endpoint(&self, name: &str) -> Option<&EndpointStats> {
        self.endpoints.iter().find(|stats| stats.endpoint == name)
    }
}

#[derive(Debug)]
struct Ledger {
    counts: OutcomeCounts,
    latencies: VecDeque<Duration>,
    failure_streak: u32,
    last_outcome: Option<AttemptOutcome>,
    last_status: Option<u16>,
}

impl Ledger {
    fn new(window: usize) -> Self {
        Self {
            counts: OutcomeCounts::default(),
            latencies: VecDeque::with_capacity(window),
            failure_streak: 0,
            last_outcome: None,
            last_status: None,
        }
    }

    fn record(
        &mut self,
        outcome: AttemptOutcome,
        status: Option<u16>,
        latency: Option<Duration>,
        window: usize,
    ) {
        self.counts.add(outcome);
        self.last_outcome = Some(outcome);
        if status.is_some() {
            self.last_status = status;
        }
        if outcome.is_success() {
            self.failure_streak = 0;
        } else {
            self.failure_streak = self.failure_streak.saturating_add(1);
        }
        if let Some(latency) = latency {
            if self.latencies.len() == window {
                self.latencies.pop_front();
            }
            self.latencies.push_back(latency);
        }
    }
}

#[derive(Debug)]
struct MetricsState {
    started_at: DateTime<Utc>,
    window: usize,
    ledgers: BTreeMap<String, Ledger>,
}

/// Thread-safe collector fed by [`MetricsHandler`](super::events::MetricsHandler).
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Keep the latest `window` latency samples per endpoint.
    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                started_at: Utc::now(),
                window: window.max(16),
                ledgers: BTreeMap::new(),
            })),
        }
    }

    /// Record one classified attempt. `status` and `latency` are absent when
    /// the attempt never produced a response.
    pub fn record(
        &self,
        endpoint: &str,
        outcome: AttemptOutcome,
        status: Option<u16>,
        latency: Option<Duration>,
    ) {
        let mut state = self.inner.lock().expect("metrics lock poisoned");
        let window = state.window;
        state
            .ledgers
            .entry(endpoint.to_string())
            .or_insert_with(|| Ledger::new(window))
            .record(outcome, status, latency, window);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.inner.lock().expect("metrics lock poisoned");
        let mut totals = OutcomeCounts::default();
        let mut samples = Vec::new();
        let endpoints = state
            .ledgers
            .iter()
            .map(|(endpoint, ledger)| {
                totals.merge(&ledger.counts);
                samples.extend(ledger.latencies.iter().copied());
                EndpointStats {
                    endpoint: endpoint.clone(),
                    counts: ledger.counts,
                    latency: LatencySummary::over(ledger.latencies.iter().copied().collect()),
                    failure_streak: ledger.failure_streak,
                    last_outcome: ledger.last_outcome,
                    last_status: ledger.last_status,
                }
            })
            .collect();
        MetricsSnapshot {
            global: GlobalStats {
                started_at: state.started_at,
                counts: totals,
                latency: LatencySummary::over(samples),
            },
            endpoints,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
