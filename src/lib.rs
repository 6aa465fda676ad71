//! # searchguard-rs
//!
//! Resilient search and page-fetch orchestration for backends that rate
//! limit and challenge automated clients.
//!
//! Requests run through a bounded concurrency limiter, are tuned by an
//! adaptive latency controller, fail over between equivalent search
//! endpoints, and are classified by a multi-stage block detector. Blocked
//! plain fetches can escalate to a supervised browser pool that persists
//! cookies per context and relaunches headed when headless sessions keep
//! getting challenged.
//!
//! ## Features
//!
//! - Priority-aware concurrency limiter with ordered batch execution
//! - Latency trend analysis driving concurrency, timeouts and failover
//! - Endpoint router that never revisits an abandoned endpoint within a call
//! - Block detection with confidence scores and categories
//! - Retry orchestrator with per-category backoff and browser escalation
//! - Browser pool with prewarmed tabs, context persistence and headed mode
//!
//! ## Example
//!
//! ```no_run
//! use searchguard_rs::{SearchOptions, SearchOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = SearchOrchestrator::new()?;
//!     // Launch the browser pool now instead of on the first fallback.
//!     orchestrator.start().await?;
//!     let results = orchestrator
//!         .search("rust async runtimes", SearchOptions::default().with_count(5))
//!         .await?;
//!     for result in results {
//!         println!("{}. {} <{}>", result.position, result.title, result.url);
//!     }
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

mod orchestrator;

pub mod browser;
pub mod config;
pub mod core;
pub mod detection;
pub mod modules;

pub use crate::orchestrator::{OrchestratorBuilder, SearchOrchestrator};

pub use crate::config::{ConfigError, OrchestratorConfig, SearchDefaults};

pub use crate::core::{
    BatchOptions,
    BatchResult,
    FailureKind,
    FetchOptions,
    FetchOutcome,
    HttpResponse,
    OrchestratorError,
    OrchestratorResult,
    OutputFormat,
    PageHttpClient,
    RenderMode,
    RenderedBy,
    ReqwestPageClient,
    SafeSearch,
    SearchOptions,
    SearchResult,
    TimeRange,
    TransportError,
};

pub use crate::detection::{
    BlockCategory,
    BlockDetector,
    DetectionConfig,
    DetectionResult,
    PageKind,
};

pub use crate::browser::{
    BrowserBackend,
    BrowserError,
    BrowserMode,
    BrowserPool,
    BrowserPoolConfig,
    BrowserSession,
    ContextSnapshot,
    ManagedTab,
    NavigationRequest,
    NavigationResponse,
    PoolStats,
    ProcessBackend,
    ProcessBackendConfig,
};

pub use crate::modules::{
    AdaptiveAction,
    AdaptiveConfig,
    AttemptOutcome,
    ConcurrencyLimiter,
    ConcurrencyStats,
    Endpoint,
    EndpointRouter,
    EventDispatcher,
    EventHandler,
    LimiterConfig,
    LoggingHandler,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    OrchestratorEvent,
    Priority,
    ResponseTimeStats,
    RetryConfig,
    RetryOrchestrator,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
