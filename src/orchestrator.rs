//! High level search orchestration.
//!
//! Wires the concurrency limiter, adaptive controller, endpoint router, block
//! detection, retry orchestrator and browser pool together behind `search`,
//! `batch_search` and `fetch_page`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::sleep;
use url::Url;

use crate::browser::{
	BrowserBackend, BrowserPool, BrowserPoolConfig, NavigationRequest, NavigationResponse,
	PoolStats, ProcessBackend, ProcessBackendConfig,
};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::core::{
	BatchOptions, BatchResult, EARLY_FAILURE_WINDOW, FetchOptions, FetchOutcome, HttpResponse,
	OrchestratorError, OrchestratorResult, PageHttpClient, ReqwestPageClient, RenderMode,
	RenderedBy, SearchOptions, SearchResult, TransportError, page_title, parse_results,
};
use crate::detection::{BlockDetector, DetectionResult, PageKind};
use crate::modules::adaptive::{AdaptiveAction, AdaptiveController, Observation, ResponseTimeStats};
use crate::modules::concurrency::{
	ConcurrencyLimiter, ConcurrencyStats, ExecuteAllOptions, Priority, TaskOutcome,
};
use crate::modules::endpoints::{Endpoint, EndpointRouter, EndpointSweep};
use crate::modules::events::{
	AdaptiveEvent, BlockedEvent, ErrorEvent, EscalationEvent, EventDispatcher, EventHandler,
	LoggingHandler, MetricsHandler, OrchestratorEvent, RequestEvent, ResponseEvent,
};
use crate::modules::metrics::{AttemptOutcome, MetricsCollector, MetricsSnapshot};
use crate::modules::retry::{AttemptContext, AttemptMode, RetryConfig, RetryOrchestrator};

/// Fluent builder for [`SearchOrchestrator`].
pub struct OrchestratorBuilder {
	config: OrchestratorConfig,
	http: Option<Arc<dyn PageHttpClient>>,
	backend: Option<Arc<dyn BrowserBackend>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl OrchestratorBuilder {
	pub fn new() -> Self {
		Self {
			config: OrchestratorConfig::default(),
			http: None,
			backend: None,
			handlers: Vec::new(),
		}
	}

	/// Replace the whole configuration. Later builder calls still apply.
	pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_endpoints<I>(mut self, endpoints: I) -> Self
	where
		I: IntoIterator<Item = Endpoint>,
	{
		self.config.endpoints = endpoints.into_iter().collect();
		self
	}

	/// Bound for the limiter and the ceiling the adaptive controller restores to.
	pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
		self.config.limiter.max_concurrency = max_concurrency;
		self.config.adaptive.max_concurrency = max_concurrency;
		self
	}

	/// Nominal per-request timeout.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.config.adaptive.nominal_timeout = timeout;
		self
	}

	pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
		self.config.retry = config;
		self
	}

	pub fn with_browser_config(mut self, config: BrowserPoolConfig) -> Self {
		self.config.browser = config;
		self
	}

	/// Settings for the default process-backed automation engine.
	pub fn with_engine_config(mut self, config: ProcessBackendConfig) -> Self {
		self.config.engine = config;
		self
	}

	pub fn with_browser_backend(mut self, backend: Arc<dyn BrowserBackend>) -> Self {
		self.backend = Some(backend);
		self
	}

	pub fn with_http_client(mut self, client: Arc<dyn PageHttpClient>) -> Self {
		self.http = Some(client);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_browser_fallback(mut self) -> Self {
		self.config.enable_browser_fallback = false;
		self
	}

	pub fn disable_adaptive_control(mut self) -> Self {
		self.config.enable_adaptive_control = false;
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.config.enable_metrics = false;
		self
	}

	pub fn build(self) -> OrchestratorResult<SearchOrchestrator> {
		SearchOrchestrator::assemble(self)
	}
}

impl Default for OrchestratorBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Page fetched over plain HTTP that passed block detection.
struct PlainPage {
	response: HttpResponse,
	body: String,
	detection: DetectionResult,
}

/// Page rendered by the automation engine that passed block detection.
struct RenderedPage {
	response: NavigationResponse,
	final_url: Url,
	detection: DetectionResult,
}

/// Main search orchestrator.
pub struct SearchOrchestrator {
	config: OrchestratorConfig,
	http: Arc<dyn PageHttpClient>,
	router: EndpointRouter,
	limiter: ConcurrencyLimiter,
	adaptive: Option<Mutex<AdaptiveController>>,
	retry: RetryOrchestrator,
	detector: BlockDetector,
	pool: Option<BrowserPool>,
	metrics: Option<MetricsCollector>,
	events: Arc<EventDispatcher>,
}

impl SearchOrchestrator {
	/// Construct an orchestrator with default configuration.
	pub fn new() -> OrchestratorResult<Self> {
		OrchestratorBuilder::new().build()
	}

	pub fn builder() -> OrchestratorBuilder {
		OrchestratorBuilder::new()
	}

	fn assemble(builder: OrchestratorBuilder) -> OrchestratorResult<Self> {
		let OrchestratorBuilder {
			config,
			http,
			backend,
			handlers,
		} = builder;
		config.validate()?;

		let router = EndpointRouter::new(config.endpoints.clone()).ok_or_else(|| {
			ConfigError::Invalid("at least one endpoint is required".into())
		})?;
		let http: Arc<dyn PageHttpClient> = match http {
			Some(client) => client,
			None => Arc::new(ReqwestPageClient::new()?),
		};

		let metrics = config.enable_metrics.then(MetricsCollector::new);
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in handlers {
			events.register_handler(handler);
		}
		let events = Arc::new(events);

		let adaptive = config
			.enable_adaptive_control
			.then(|| Mutex::new(AdaptiveController::new(config.adaptive.clone())));

		let pool = config.enable_browser_fallback.then(|| {
			let backend: Arc<dyn BrowserBackend> = backend
				.unwrap_or_else(|| Arc::new(ProcessBackend::new(config.engine.clone())));
			BrowserPool::new(config.browser.clone(), backend)
		});

		log::debug!(
			"orchestrator ready: {} endpoint(s), concurrency {}, browser fallback {}",
			router.len(),
			config.limiter.max_concurrency,
			if pool.is_some() { "on" } else { "off" }
		);

		Ok(Self {
			limiter: ConcurrencyLimiter::new(config.limiter.clone()),
			retry: RetryOrchestrator::new(config.retry.clone()).with_events(events.clone()),
			detector: BlockDetector::from_config(&config.detection),
			config,
			http,
			router,
			adaptive,
			pool,
			metrics,
			events,
		})
	}

	pub fn config(&self) -> &OrchestratorConfig {
		&self.config
	}

	/// Launch the automation engine and prewarm tabs. Without this the pool
	/// starts lazily on the first browser attempt.
	pub async fn start(&self) -> OrchestratorResult<()> {
		if let Some(pool) = &self.pool {
			pool.start().await?;
		}
		Ok(())
	}

	/// Run one search through the limiter, retrying and failing over
	/// between endpoints as needed.
	pub async fn search(
		&self,
		query: &str,
		options: SearchOptions,
	) -> OrchestratorResult<Vec<SearchResult>> {
		let label = format!("search '{query}'");
		self.limiter
			.execute(self.search_unbounded(query, &options), Priority::Normal, &label)
			.await
	}

	/// Same as [`search`](Self::search) without taking a limiter slot.
	async fn search_unbounded(
		&self,
		query: &str,
		options: &SearchOptions,
	) -> OrchestratorResult<Vec<SearchResult>> {
		let label = format!("search '{query}'");
		let count = options.count.clamp(1, self.config.search.max_results);
		let initial = options.timeout.unwrap_or_else(|| self.current_timeout());
		let sweep = Mutex::new(self.router.sweep());
		let sweep = &sweep;

		let outcome = self
			.retry
			.run_with_escalation(
				&label,
				initial,
				AttemptMode::Plain,
				self.escalation_allowed(),
				move |context| self.search_attempt(query, options, count, sweep, context),
			)
			.await?;

		let switches = sweep.lock().expect("endpoint sweep poisoned").switches();
		log::debug!(
			"{label}: {} result(s) after {} attempt(s), {switches} endpoint switch(es)",
			outcome.value.len(),
			outcome.attempts
		);
		Ok(outcome.value)
	}

	async fn search_attempt(
		&self,
		query: &str,
		options: &SearchOptions,
		count: usize,
		sweep: &Mutex<EndpointSweep<'_>>,
		context: AttemptContext,
	) -> OrchestratorResult<Vec<SearchResult>> {
		let current = sweep.lock().expect("endpoint sweep poisoned").current();
		let Some((index, endpoint)) = current else {
			return Err(OrchestratorError::AllEndpointsFailed {
				attempted: self.router.len(),
			});
		};
		let url = options.build_url(&endpoint.url, query);

		let result = match context.mode {
			AttemptMode::Plain => self
				.fetch_plain(&endpoint.name, &url, PageKind::SearchResults, context)
				.await
				.and_then(|page| parse_page(&page.body, &page.response.url, count)),
			AttemptMode::Browser => {
				let request = NavigationRequest::new(&url, context.timeout);
				self.render(&endpoint.name, &url, PageKind::SearchResults, None, request, context.attempt)
					.await
					.and_then(|page| parse_page(&page.response.html, &page.final_url, count))
			}
		};

		match result {
			Err(err) if err.warrants_failover() => {
				let mut sweep = sweep.lock().expect("endpoint sweep poisoned");
				if sweep.advance(index).is_none() {
					log::warn!("every endpoint failed; last error from {}: {err}", endpoint.name);
					return Err(OrchestratorError::AllEndpointsFailed {
						attempted: sweep.attempted(),
					});
				}
				Err(err)
			}
			other => other,
		}
	}

	/// Run independent searches with bounded parallelism. Results come back
	/// in input order and one failure never affects the others unless
	/// `fail_fast` is set.
	pub async fn batch_search<I, S>(&self, queries: I, options: BatchOptions) -> Vec<BatchResult>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let queries: Vec<String> = queries.into_iter().map(Into::into).collect();
		if queries.is_empty() {
			return Vec::new();
		}

		let delay = options.query_delay.unwrap_or(self.config.search.query_delay);
		let last_start = tokio::sync::Mutex::new(None::<Instant>);
		let last_start = &last_start;
		let search = &options.search;
		let per_query = options.timeout;

		let tasks: Vec<_> = queries
			.iter()
			.map(|query| async move {
				self.pace(last_start, delay).await;
				let started = Instant::now();
				let result = match per_query {
					Some(limit) => {
						match tokio::time::timeout(limit, self.search_unbounded(query, search)).await {
							Ok(result) => result,
							Err(_) => Err(OrchestratorError::Timeout(limit)),
						}
					}
					None => self.search_unbounded(query, search).await,
				};
				match result {
					Ok(results) => Ok((results, started.elapsed())),
					Err(err) => Err((err, started.elapsed())),
				}
			})
			.collect();

		let total = queries.len();
		let outcomes = self
			.limiter
			.execute_all(
				tasks,
				ExecuteAllOptions {
					fail_fast: options.fail_fast,
					max_in_flight: options.max_concurrency,
					on_progress: Some(Arc::new(move |finished: usize, _: usize| {
						log::debug!("batch progress: {finished}/{total}");
					})),
					..ExecuteAllOptions::default()
				},
			)
			.await;

		outcomes
			.into_iter()
			.zip(queries)
			.enumerate()
			.map(|(index, (outcome, query))| {
				let (results, error, duration) = match outcome {
					TaskOutcome::Completed((results, duration)) => (results, None, duration),
					TaskOutcome::Failed((err, duration)) => (Vec::new(), Some(err.to_string()), duration),
					TaskOutcome::TimedOut(limit) => {
						(Vec::new(), Some(format!("timed out after {limit:?}")), limit)
					}
					TaskOutcome::Cancelled => (
						Vec::new(),
						Some(OrchestratorError::Cancelled(query.clone()).to_string()),
						Duration::ZERO,
					),
				};
				BatchResult {
					index,
					query,
					success: error.is_none(),
					results,
					error,
					duration,
				}
			})
			.collect()
	}

	/// Space query starts by `delay`, plus whatever backoff the limiter
	/// advises after recent failures.
	async fn pace(&self, last_start: &tokio::sync::Mutex<Option<Instant>>, delay: Duration) {
		let mut last = last_start.lock().await;
		if let Some(previous) = *last {
			let wait = delay
				.saturating_sub(previous.elapsed())
				.max(self.limiter.backoff_delay());
			if !wait.is_zero() {
				sleep(wait).await;
			}
		}
		*last = Some(Instant::now());
	}

	/// Fetch one page for content extraction. `Auto` falls back to the
	/// automation engine when the plain response is blocked.
	pub async fn fetch_page(&self, url: &str, options: FetchOptions) -> OrchestratorResult<FetchOutcome> {
		let url = Url::parse(url)?;
		let label = format!("fetch {url}");
		let start_mode = match options.render {
			RenderMode::Browser => AttemptMode::Browser,
			RenderMode::Plain | RenderMode::Auto => AttemptMode::Plain,
		};
		let allow_escalation = options.render == RenderMode::Auto && self.escalation_allowed();
		let initial = options.timeout.unwrap_or_else(|| self.current_timeout());
		let started = Instant::now();
		let (url_ref, options_ref) = (&url, &options);

		let outcome = self
			.limiter
			.execute(
				self.retry.run_with_escalation(
					&label,
					initial,
					start_mode,
					allow_escalation,
					move |context| self.fetch_attempt(url_ref, options_ref, context),
				),
				Priority::Normal,
				&label,
			)
			.await?;

		let mut page = outcome.value;
		page.attempts = outcome.attempts;
		page.duration = started.elapsed();
		Ok(page)
	}

	async fn fetch_attempt(
		&self,
		url: &Url,
		options: &FetchOptions,
		context: AttemptContext,
	) -> OrchestratorResult<FetchOutcome> {
		let site = url.host_str().unwrap_or("unknown").to_string();
		match context.mode {
			AttemptMode::Plain => {
				let page = self.fetch_plain(&site, url, PageKind::Generic, context).await?;
				Ok(FetchOutcome {
					url: url.clone(),
					title: page_title(&page.body),
					final_url: page.response.url,
					status: page.response.status,
					html: page.body,
					rendered_by: RenderedBy::Http,
					detection: page.detection,
					attempts: context.attempt,
					duration: Duration::ZERO,
				})
			}
			AttemptMode::Browser => {
				let request = NavigationRequest::new(url, context.timeout)
					.with_format(options.format)
					.with_max_length(options.max_length)
					.with_readability(options.readability);
				let page = self
					.render(
						&site,
						url,
						PageKind::Generic,
						options.context_id.as_deref(),
						request,
						context.attempt,
					)
					.await?;
				let title = page
					.response
					.title
					.clone()
					.filter(|title| !title.trim().is_empty())
					.or_else(|| page_title(&page.response.html));
				Ok(FetchOutcome {
					url: url.clone(),
					final_url: page.final_url,
					status: page.response.status.unwrap_or(200),
					html: page.response.html,
					title,
					rendered_by: RenderedBy::Browser,
					detection: page.detection,
					attempts: context.attempt,
					duration: Duration::ZERO,
				})
			}
		}
	}

	/// One plain HTTP request: status mapping, block detection and the
	/// adaptive feedback loop.
	async fn fetch_plain(
		&self,
		endpoint: &str,
		url: &Url,
		kind: PageKind,
		context: AttemptContext,
	) -> OrchestratorResult<PlainPage> {
		self.events.dispatch(OrchestratorEvent::Request(RequestEvent {
			endpoint: endpoint.to_string(),
			url: url.clone(),
			attempt: context.attempt,
			mode: AttemptMode::Plain,
			timestamp: chrono::Utc::now(),
		}));

		let started = Instant::now();
		let response = match self.http.get(url, context.timeout).await {
			Ok(response) => response,
			Err(err) => {
				let err = transport_error(err);
				self.events.dispatch(OrchestratorEvent::Error(ErrorEvent {
					endpoint: endpoint.to_string(),
					error: err.to_string(),
					timestamp: chrono::Utc::now(),
				}));
				self.observe(started.elapsed(), false);
				return Err(err);
			}
		};
		let latency = response.elapsed;
		let report = |outcome| {
			self.report_response(endpoint, &response.url, response.status, outcome, latency);
		};

		if response.status == 429 {
			report(AttemptOutcome::RateLimited);
			self.observe(latency, false);
			return Err(OrchestratorError::RateLimited {
				endpoint: endpoint.to_string(),
				retry_after: response.retry_after(),
			});
		}

		let body = response.text();
		let detection = self.detector.detect_body(&body, &response.url, kind);
		if detection.is_blocked {
			report(AttemptOutcome::Blocked);
			self.report_block(endpoint, &response.url, &detection);
			if let Some(adaptive) = &self.adaptive {
				adaptive
					.lock()
					.expect("adaptive controller poisoned")
					.record_bot_block();
			}
			self.observe(latency, false);
			return Err(detection.to_error(response.url.as_str()));
		}

		match response.status {
			status @ 400..=499 => {
				report(AttemptOutcome::ClientError);
				self.observe(latency, false);
				Err(OrchestratorError::ClientError {
					status,
					url: response.url.to_string(),
				})
			}
			status @ 500..=u16::MAX => {
				report(AttemptOutcome::ServerError);
				self.observe(latency, false);
				Err(OrchestratorError::ServerError {
					status,
					url: response.url.to_string(),
				})
			}
			_ => {
				report(AttemptOutcome::Success);
				self.observe(latency, true);
				Ok(PlainPage {
					response,
					body,
					detection,
				})
			}
		}
	}

	/// One navigation through the browser pool. Repeated blocks relaunch
	/// the engine headed.
	async fn render(
		&self,
		endpoint: &str,
		url: &Url,
		kind: PageKind,
		context_id: Option<&str>,
		request: NavigationRequest,
		attempt: u32,
	) -> OrchestratorResult<RenderedPage> {
		let Some(pool) = &self.pool else {
			return Err(OrchestratorError::BrowserUnavailable(
				"browser fallback is disabled".into(),
			));
		};

		let mut tab = pool.acquire_tab(context_id).await?;
		let request = request.with_challenge_wait(pool.challenge_wait());
		self.events.dispatch(OrchestratorEvent::Request(RequestEvent {
			endpoint: endpoint.to_string(),
			url: url.clone(),
			attempt,
			mode: AttemptMode::Browser,
			timestamp: chrono::Utc::now(),
		}));

		let started = Instant::now();
		let result = pool.navigate(&mut tab, request).await;
		pool.release(tab).await;
		let response = match result {
			Ok(response) => response,
			Err(err) => {
				let err = OrchestratorError::from(err);
				self.events.dispatch(OrchestratorEvent::Error(ErrorEvent {
					endpoint: endpoint.to_string(),
					error: err.to_string(),
					timestamp: chrono::Utc::now(),
				}));
				return Err(err);
			}
		};

		let final_url = response
			.final_url
			.as_deref()
			.and_then(|raw| Url::parse(raw).ok())
			.unwrap_or_else(|| url.clone());
		let status = response.status.unwrap_or(200);
		let latency = started.elapsed();

		let detection = self.detector.detect_body(&response.html, &final_url, kind);
		if detection.is_blocked {
			self.report_response(endpoint, &final_url, status, AttemptOutcome::Blocked, latency);
			self.report_block(endpoint, &final_url, &detection);
			if pool.record_block() {
				self.events.dispatch(OrchestratorEvent::Escalation(EscalationEvent {
					operation: format!("render {url}"),
					reason: "repeated blocks in headless mode".into(),
					headed: true,
					timestamp: chrono::Utc::now(),
				}));
				if let Err(err) = pool.switch_to_headed().await {
					log::warn!("failed to relaunch the automation engine headed: {err}");
				}
			}
			return Err(detection.to_error(final_url.as_str()));
		}

		self.report_response(endpoint, &final_url, status, AttemptOutcome::Success, latency);
		pool.record_success();
		Ok(RenderedPage {
			response,
			final_url,
			detection,
		})
	}

	fn report_response(
		&self,
		endpoint: &str,
		url: &Url,
		status: u16,
		outcome: AttemptOutcome,
		latency: Duration,
	) {
		self.events.dispatch(OrchestratorEvent::Response(ResponseEvent {
			endpoint: endpoint.to_string(),
			url: url.clone(),
			status,
			outcome,
			latency,
			timestamp: chrono::Utc::now(),
		}));
	}

	fn report_block(&self, endpoint: &str, url: &Url, detection: &DetectionResult) {
		self.events.dispatch(OrchestratorEvent::Blocked(BlockedEvent {
			endpoint: endpoint.to_string(),
			url: url.clone(),
			confidence: detection.confidence,
			category: detection.category,
			stages: detection.triggered().collect(),
			timestamp: chrono::Utc::now(),
		}));
	}

	/// Feed one plain-path outcome to the adaptive controller and apply
	/// whatever it asks for.
	fn observe(&self, latency: Duration, success: bool) {
		let Some(adaptive) = &self.adaptive else {
			return;
		};
		let actions = adaptive
			.lock()
			.expect("adaptive controller poisoned")
			.record_outcome(Observation {
				latency,
				success,
				current_concurrency: self.limiter.max_concurrency(),
			});

		for action in actions {
			match action {
				AdaptiveAction::ReduceConcurrency { to, .. }
				| AdaptiveAction::RestoreConcurrency { to, .. } => {
					self.limiter.set_max_concurrency(to);
				}
				AdaptiveAction::IncreaseTimeout { .. } => {}
				AdaptiveAction::SwitchEndpoint => {
					self.router.advance();
				}
			}
			self.events.dispatch(OrchestratorEvent::Adaptive(AdaptiveEvent {
				action,
				timestamp: chrono::Utc::now(),
			}));
		}
	}

	fn current_timeout(&self) -> Duration {
		match &self.adaptive {
			Some(adaptive) => adaptive
				.lock()
				.expect("adaptive controller poisoned")
				.adaptive_timeout(),
			None => self.config.timeout(),
		}
	}

	fn escalation_allowed(&self) -> bool {
		self.pool.is_some() && self.config.retry.browser_escalation
	}

	/// Per-endpoint metrics, when enabled.
	pub fn metrics(&self) -> Option<MetricsSnapshot> {
		self.metrics.as_ref().map(MetricsCollector::snapshot)
	}

	pub fn concurrency_stats(&self) -> ConcurrencyStats {
		self.limiter.stats()
	}

	pub fn response_time_stats(&self) -> Option<ResponseTimeStats> {
		self.adaptive
			.as_ref()
			.map(|adaptive| adaptive.lock().expect("adaptive controller poisoned").stats())
	}

	pub fn pool_stats(&self) -> Option<PoolStats> {
		self.pool.as_ref().map(BrowserPool::stats)
	}

	pub fn router(&self) -> &EndpointRouter {
		&self.router
	}

	pub fn limiter(&self) -> &ConcurrencyLimiter {
		&self.limiter
	}

	pub fn browser_pool(&self) -> Option<&BrowserPool> {
		self.pool.as_ref()
	}

	/// Tear down the browser pool. Plain searches keep working afterwards.
	pub async fn shutdown(&self) {
		if let Some(pool) = &self.pool {
			pool.shutdown().await;
		}
	}
}

fn parse_page(html: &str, base: &Url, count: usize) -> OrchestratorResult<Vec<SearchResult>> {
	parse_results(html, base, count).map_err(|err| OrchestratorError::Parse(err.to_string()))
}

fn transport_error(err: TransportError) -> OrchestratorError {
	match err {
		TransportError::Timeout(limit) => OrchestratorError::Timeout(limit),
		TransportError::Connect { elapsed, message } if elapsed < EARLY_FAILURE_WINDOW => {
			OrchestratorError::EarlyTimeout { elapsed, message }
		}
		other => OrchestratorError::Transport(other.to_string()),
	}
}
