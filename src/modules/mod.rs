//! Orchestration building blocks
//!
//! Scheduling, adaptive tuning, endpoint failover, retries, events and
//! metrics. Each module is usable on its own; the orchestrator wires them
//! together.

pub mod adaptive;
pub mod concurrency;
pub mod endpoints;
pub mod events;
pub mod metrics;
pub mod retry;

// Re-export commonly used types
pub use adaptive::{
    AdaptiveAction, AdaptiveConfig, AdaptiveController, Observation, ResponseTimeStats, Trend,
};
pub use concurrency::{
    ConcurrencyLimiter, ConcurrencyStats, ExecuteAllOptions, LimiterConfig, Priority, ProgressFn,
    TaskOutcome,
};
pub use endpoints::{Endpoint, EndpointRouter, EndpointSweep};
pub use events::{
    AdaptiveEvent, BlockedEvent, ErrorEvent, EscalationEvent, EventDispatcher, EventHandler,
    LoggingHandler, MetricsHandler, OrchestratorEvent, RequestEvent, ResponseEvent, RetryEvent,
};
pub use metrics::{
    AttemptOutcome, EndpointStats, GlobalStats, LatencySummary, MetricsCollector, MetricsSnapshot,
    OutcomeCounts,
};
pub use retry::{
    AttemptContext, AttemptMode, RetryConfig, RetryDecision, RetryOrchestrator, RetryOutcome,
};
