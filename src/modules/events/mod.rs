//! Event system for the orchestration layer.
//!
//! Provides hooks for metrics, logging, and custom reactions around requests,
//! block detections, retries and adaptive adjustments.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::adaptive::AdaptiveAction;
use super::metrics::{AttemptOutcome, MetricsCollector};
use super::retry::AttemptMode;
use crate::detection::BlockCategory;

/// Outbound request about to be issued.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub endpoint: String,
    pub url: Url,
    pub attempt: u32,
    pub mode: AttemptMode,
    pub timestamp: DateTime<Utc>,
}

/// Response received and classified.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub endpoint: String,
    pub url: Url,
    pub status: u16,
    pub outcome: AttemptOutcome,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BlockedEvent {
    pub endpoint: String,
    pub url: Url,
    pub confidence: u8,
    pub category: Option<BlockCategory>,
    pub stages: Vec<&'static str>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub operation: String,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EscalationEvent {
    pub operation: String,
    pub reason: String,
    /// Whether the browser is being relaunched with a visible window.
    pub headed: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AdaptiveEvent {
    pub action: AdaptiveAction,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub endpoint: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    Request(RequestEvent),
    Response(ResponseEvent),
    Blocked(BlockedEvent),
    Retry(RetryEvent),
    Escalation(EscalationEvent),
    Adaptive(AdaptiveEvent),
    Error(ErrorEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &OrchestratorEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: OrchestratorEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::Request(req) => {
                log::debug!("-> [{}] {} ({:?}, attempt {})", req.endpoint, req.url, req.mode, req.attempt);
            }
            OrchestratorEvent::Response(resp) => {
                log::debug!(
                    "<- [{}] {} -> {} {:?} ({:.2}s)",
                    resp.endpoint,
                    resp.url,
                    resp.status,
                    resp.outcome,
                    resp.latency.as_secs_f64()
                );
            }
            OrchestratorEvent::Blocked(blocked) => {
                log::warn!(
                    "blocked at {} (confidence {}, {:?}, stages: {})",
                    blocked.url,
                    blocked.confidence,
                    blocked.category,
                    blocked.stages.join(",")
                );
            }
            OrchestratorEvent::Retry(retry) => {
                log::info!(
                    "retry {} attempt {} after {:.2}s: {}",
                    retry.operation,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            OrchestratorEvent::Escalation(escalation) => {
                log::info!(
                    "escalating {} to {} browser: {}",
                    escalation.operation,
                    if escalation.headed { "headed" } else { "headless" },
                    escalation.reason
                );
            }
            OrchestratorEvent::Adaptive(adaptive) => {
                log::info!("adaptive adjustment: {:?}", adaptive.action);
            }
            OrchestratorEvent::Error(error) => {
                log::warn!("warning {} -> {}", error.endpoint, error.error);
            }
        }
    }
}

/// Feeds the metrics collector. Responses arrive already classified, so
/// `Blocked` events carry nothing the collector has not seen.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::Response(resp) => {
                self.metrics.record(
                    &resp.endpoint,
                    resp.outcome,
                    Some(resp.status),
                    Some(resp.latency),
                );
            }
            OrchestratorEvent::Error(error) => {
                self.metrics
                    .record(&error.endpoint, AttemptOutcome::Transport, None, None);
            }
            _ => {}
        }
    }
}
