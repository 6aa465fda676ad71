//! Browser resource pool.
//!
//! Supervises a single automation engine and multiplexes tabs across callers:
//!
//! - at most `max_tabs` tabs open at once (handed out, prewarmed or being
//!   created); callers beyond that poll until a slot frees up
//! - contexts keyed by id, created lazily from persisted snapshots and
//!   persisted again before they are closed
//! - a background sweep reclaiming idle contexts
//! - a headless to headed switch after repeated blocks
//!
//! The engine handle is rebuilt under a single initialisation lock, so
//! concurrent acquisitions never launch two engines.

pub mod backend;
pub mod state;
pub mod worker;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

pub use backend::{
    BrowserBackend, BrowserMode, BrowserSession, ProcessBackend, ProcessBackendConfig, TabId,
};
pub use state::{ContextSnapshot, ContextStore, OriginStorage, StorageEntry, StoredCookie};
pub use worker::{NavigationRequest, NavigationResponse, WORKER_SCRIPT, WorkerCommand};

/// Context used when the caller does not name one. Never reclaimed while the
/// engine runs.
pub const DEFAULT_CONTEXT: &str = "default";

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("automation engine could not be launched: {0}")]
    Launch(String),
    #[error("automation engine disconnected")]
    Disconnected,
    #[error("navigation worker exceeded its {0:?} deadline")]
    WorkerTimeout(Duration),
    #[error("navigation worker exited with {code:?}: {stderr}")]
    WorkerFailed { code: Option<i32>, stderr: String },
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("worker protocol error: {0}")]
    Protocol(String),
    #[error("no tab became available within {waited:?}")]
    PoolExhausted { waited: Duration },
    #[error("unknown tab {0}")]
    UnknownTab(TabId),
    #[error("unknown context '{0}'")]
    UnknownContext(String),
    #[error("{0} belongs to an engine that has since been replaced")]
    StaleTab(TabId),
    #[error("browser pool is shutting down")]
    ShuttingDown,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BrowserPoolConfig {
    pub max_tabs: usize,
    /// Tabs created ahead of demand in the default context.
    pub prewarm_tabs: usize,
    #[serde(with = "crate::config::duration_ms")]
    pub sweep_interval: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub context_idle_timeout: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub acquire_poll_interval: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub acquire_timeout: Duration,
    /// Consecutive blocks while headless before relaunching headed.
    pub headed_switch_after: u32,
    pub allow_headed: bool,
    /// Extended wait for a human to clear an interactive challenge.
    #[serde(with = "crate::config::duration_ms")]
    pub challenge_wait: Duration,
    pub utilization_warning: f64,
    /// Base path for per-context snapshots; `None` disables persistence.
    pub state_path: Option<PathBuf>,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            max_tabs: 5,
            prewarm_tabs: 2,
            sweep_interval: Duration::from_secs(30),
            context_idle_timeout: Duration::from_secs(300),
            acquire_poll_interval: Duration::from_millis(100),
            acquire_timeout: Duration::from_secs(60),
            headed_switch_after: 2,
            allow_headed: true,
            challenge_wait: Duration::from_secs(120),
            utilization_warning: 0.8,
            state_path: None,
        }
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub mode: BrowserMode,
    pub running: bool,
    pub generation: u64,
    pub active_tabs: usize,
    pub prewarmed_tabs: usize,
    pub pending_tabs: usize,
    pub open_tabs: usize,
    pub max_tabs: usize,
    pub contexts: usize,
    pub utilization: f64,
    pub consecutive_blocks: u32,
    pub mode_switches: u32,
    pub tabs_created: u64,
    pub tabs_closed: u64,
}

/// Per-tab usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TabUsage {
    pub successes: u32,
    pub errors: u32,
    pub busy: Duration,
    pub last_failed: bool,
}

/// A tab on loan from the pool. Hand it back with [`BrowserPool::release`];
/// dropping it releases it in the background.
#[derive(Debug)]
pub struct ManagedTab {
    id: TabId,
    context_id: String,
    generation: u64,
    created_at: Instant,
    usage: TabUsage,
    pool: Weak<PoolInner>,
    released: bool,
}

impl ManagedTab {
    pub fn id(&self) -> TabId {
        self.id
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn usage(&self) -> TabUsage {
        self.usage
    }

    fn record(&mut self, ok: bool, elapsed: Duration) {
        if ok {
            self.usage.successes += 1;
        } else {
            self.usage.errors += 1;
        }
        self.usage.busy += elapsed;
        self.usage.last_failed = !ok;
    }
}

impl Drop for ManagedTab {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(inner) = self.pool.upgrade() else {
            return;
        };
        let (id, generation) = (self.id, self.generation);
        let context_id = std::mem::take(&mut self.context_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::debug!("{id} dropped without release; releasing in background");
                handle.spawn(async move {
                    inner.release_tab(id, &context_id, generation, false).await;
                });
            }
            Err(_) => log::warn!("{id} dropped outside a runtime; its slot is lost until shutdown"),
        }
    }
}

#[derive(Debug)]
struct ActiveTab {
    context_id: String,
}

#[derive(Debug)]
struct ContextEntry {
    last_used: Instant,
    active_tabs: usize,
}

impl ContextEntry {
    fn new() -> Self {
        Self {
            last_used: Instant::now(),
            active_tabs: 0,
        }
    }
}

struct PoolState {
    mode: BrowserMode,
    generation: u64,
    session: Option<Arc<dyn BrowserSession>>,
    active: HashMap<TabId, ActiveTab>,
    prewarmed: VecDeque<TabId>,
    pending: usize,
    pending_prewarm: usize,
    contexts: HashMap<String, ContextEntry>,
    consecutive_blocks: u32,
    mode_switches: u32,
    tabs_created: u64,
    tabs_closed: u64,
    shutting_down: bool,
}

impl PoolState {
    fn open_tabs(&self) -> usize {
        self.active.len() + self.prewarmed.len() + self.pending
    }

    /// Forget everything tied to the current engine.
    fn reset(&mut self) {
        self.generation += 1;
        self.session = None;
        self.active.clear();
        self.prewarmed.clear();
        self.contexts.clear();
    }
}

enum Claim {
    Prewarmed(TabId),
    Reserved { evicted: Option<TabId> },
    Full,
}

struct PoolInner {
    config: BrowserPoolConfig,
    backend: Arc<dyn BrowserBackend>,
    store: Option<ContextStore>,
    /// Serialises engine launch, mode switches and shutdown.
    init: tokio::sync::Mutex<()>,
    /// Serialises context creation and teardown.
    context_lock: tokio::sync::Mutex<()>,
    state: Mutex<PoolState>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("browser pool state poisoned")
    }

    fn live_session(&self) -> Option<(Arc<dyn BrowserSession>, u64)> {
        let state = self.lock_state();
        state
            .session
            .as_ref()
            .filter(|session| session.is_connected())
            .map(|session| (session.clone(), state.generation))
    }

    /// Running engine plus its generation, launching one if needed. The flag
    /// is set when this call performed the launch.
    async fn ensure_session(&self) -> Result<(Arc<dyn BrowserSession>, u64, bool), BrowserError> {
        if let Some((session, generation)) = self.live_session() {
            return Ok((session, generation, false));
        }

        let _init = self.init.lock().await;
        if let Some((session, generation)) = self.live_session() {
            return Ok((session, generation, false));
        }

        let mode = {
            let mut state = self.lock_state();
            if state.shutting_down {
                return Err(BrowserError::ShuttingDown);
            }
            if state.session.is_some() {
                log::warn!("automation engine disconnected; relaunching");
                state.reset();
            }
            state.mode
        };

        let session: Arc<dyn BrowserSession> = Arc::from(self.backend.launch(mode).await?);
        let installed = {
            let mut state = self.lock_state();
            if state.shutting_down {
                None
            } else {
                state.session = Some(session.clone());
                Some(state.generation)
            }
        };
        let Some(generation) = installed else {
            if let Err(err) = session.close().await {
                log::warn!("failed to close engine launched during shutdown: {err}");
            }
            return Err(BrowserError::ShuttingDown);
        };
        log::debug!("automation engine ready ({mode}, generation {generation})");
        Ok((session, generation, true))
    }

    fn spawn_replenish(self: &Arc<Self>) {
        if self.config.prewarm_tabs == 0 {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move { inner.replenish().await });
    }

    fn ensure_sweep(self: &Arc<Self>) {
        let mut slot = self.sweep.lock().expect("sweep handle poisoned");
        if slot.is_some() || self.lock_state().shutting_down {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.sweep_once().await;
            }
        }));
    }

    fn try_claim(&self, context_id: &str, generation: u64) -> Result<Claim, BrowserError> {
        let mut state = self.lock_state();
        if state.shutting_down {
            return Err(BrowserError::ShuttingDown);
        }
        if state.generation != generation {
            return Ok(Claim::Full);
        }

        if context_id == DEFAULT_CONTEXT
            && let Some(tab) = state.prewarmed.pop_front()
        {
            state.active.insert(
                tab,
                ActiveTab {
                    context_id: context_id.to_string(),
                },
            );
            let entry = state
                .contexts
                .entry(context_id.to_string())
                .or_insert_with(ContextEntry::new);
            entry.active_tabs += 1;
            entry.last_used = Instant::now();
            return Ok(Claim::Prewarmed(tab));
        }

        if state.open_tabs() < self.config.max_tabs {
            state.pending += 1;
            return Ok(Claim::Reserved { evicted: None });
        }

        // Trade a speculative default-context tab for a real request elsewhere.
        if let Some(tab) = state.prewarmed.pop_front() {
            state.pending += 1;
            return Ok(Claim::Reserved { evicted: Some(tab) });
        }
        Ok(Claim::Full)
    }

    async fn ensure_context(
        &self,
        session: &Arc<dyn BrowserSession>,
        generation: u64,
        context_id: &str,
    ) -> Result<(), BrowserError> {
        if self.touch_context(context_id, generation) {
            return Ok(());
        }

        let _guard = self.context_lock.lock().await;
        if self.touch_context(context_id, generation) {
            return Ok(());
        }

        let snapshot = match &self.store {
            Some(store) => store.load(context_id).await,
            None => None,
        };
        if snapshot.is_some() {
            log::debug!("restoring context '{context_id}' from snapshot");
        }
        session.create_context(context_id, snapshot).await?;

        let excess = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return Err(BrowserError::Disconnected);
            }
            state
                .contexts
                .insert(context_id.to_string(), ContextEntry::new());
            self.take_excess_contexts(&mut state, context_id)
        };
        for id in excess {
            log::debug!("closing context '{id}': context count above {}", self.config.max_tabs);
            self.persist_and_close(session, &id).await;
        }
        Ok(())
    }

    fn touch_context(&self, context_id: &str, generation: u64) -> bool {
        let mut state = self.lock_state();
        if state.generation != generation {
            return false;
        }
        match state.contexts.get_mut(context_id) {
            Some(entry) => {
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove idle contexts, oldest first, until the count fits `max_tabs`.
    fn take_excess_contexts(&self, state: &mut PoolState, keep: &str) -> Vec<String> {
        let excess = state.contexts.len().saturating_sub(self.config.max_tabs);
        if excess == 0 {
            return Vec::new();
        }
        let mut idle: Vec<(String, Instant)> = state
            .contexts
            .iter()
            .filter(|(id, entry)| {
                id.as_str() != DEFAULT_CONTEXT && id.as_str() != keep && entry.active_tabs == 0
            })
            .map(|(id, entry)| (id.clone(), entry.last_used))
            .collect();
        idle.sort_by_key(|(_, last_used)| *last_used);
        idle.truncate(excess);
        for (id, _) in &idle {
            state.contexts.remove(id);
        }
        idle.into_iter().map(|(id, _)| id).collect()
    }

    async fn persist_context(&self, session: &Arc<dyn BrowserSession>, context_id: &str) {
        let Some(store) = &self.store else {
            return;
        };
        match session.export_context(context_id).await {
            Ok(snapshot) => {
                if let Err(err) = store.save(context_id, &snapshot).await {
                    log::warn!("failed to persist context '{context_id}': {err}");
                }
            }
            Err(err) => log::warn!("failed to export context '{context_id}': {err}"),
        }
    }

    async fn persist_and_close(&self, session: &Arc<dyn BrowserSession>, context_id: &str) {
        self.persist_context(session, context_id).await;
        if let Err(err) = session.close_context(context_id).await {
            log::warn!("failed to close context '{context_id}': {err}");
        }
    }

    async fn create_tab(
        &self,
        session: &Arc<dyn BrowserSession>,
        generation: u64,
        context_id: &str,
    ) -> Result<TabId, BrowserError> {
        self.ensure_context(session, generation, context_id).await?;
        session.create_tab(context_id).await
    }

    async fn replenish(self: &Arc<Self>) {
        let Some((session, generation)) = self.live_session() else {
            return;
        };
        loop {
            {
                let mut state = self.lock_state();
                if state.shutting_down
                    || state.generation != generation
                    || state.prewarmed.len() + state.pending_prewarm >= self.config.prewarm_tabs
                    || state.open_tabs() >= self.config.max_tabs
                {
                    return;
                }
                state.pending += 1;
                state.pending_prewarm += 1;
            }

            let result = self.create_tab(&session, generation, DEFAULT_CONTEXT).await;

            let stale = {
                let mut state = self.lock_state();
                state.pending -= 1;
                state.pending_prewarm -= 1;
                match result {
                    Ok(tab) if state.generation == generation && !state.shutting_down => {
                        state.prewarmed.push_back(tab);
                        state.tabs_created += 1;
                        None
                    }
                    Ok(tab) => Some(tab),
                    Err(err) => {
                        log::warn!("failed to prewarm tab: {err}");
                        return;
                    }
                }
            };
            if let Some(tab) = stale {
                let _ = session.close_tab(tab).await;
                return;
            }
        }
    }

    async fn release_tab(&self, id: TabId, context_id: &str, generation: u64, healthy: bool) {
        let session = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return;
            }
            let keep = healthy
                && context_id == DEFAULT_CONTEXT
                && !state.shutting_down
                && state.prewarmed.len() + state.pending_prewarm < self.config.prewarm_tabs;
            if keep && let Some(tab) = state.active.remove(&id) {
                if let Some(entry) = state.contexts.get_mut(&tab.context_id) {
                    entry.active_tabs = entry.active_tabs.saturating_sub(1);
                    entry.last_used = Instant::now();
                }
                state.prewarmed.push_back(id);
                return;
            }
            state.session.clone()
        };

        // Close before freeing the slot so the engine never holds more than
        // `max_tabs` tabs.
        if let Some(session) = session
            && let Err(err) = session.close_tab(id).await
        {
            log::warn!("failed to close {id}: {err}");
        }

        let mut state = self.lock_state();
        if state.generation != generation {
            return;
        }
        if let Some(tab) = state.active.remove(&id) {
            state.tabs_closed += 1;
            if let Some(entry) = state.contexts.get_mut(&tab.context_id) {
                entry.active_tabs = entry.active_tabs.saturating_sub(1);
                entry.last_used = Instant::now();
            }
        }
    }

    async fn sweep_once(&self) {
        let Some((session, generation)) = self.live_session() else {
            return;
        };
        let _guard = self.context_lock.lock().await;
        let idle = {
            let mut state = self.lock_state();
            if state.generation != generation || state.shutting_down {
                return;
            }
            let utilization = state.active.len() as f64 / self.config.max_tabs.max(1) as f64;
            if utilization > self.config.utilization_warning {
                log::warn!(
                    "browser tab utilization at {:.0}% ({}/{})",
                    utilization * 100.0,
                    state.active.len(),
                    self.config.max_tabs
                );
            }
            let idle_timeout = self.config.context_idle_timeout;
            let idle: Vec<String> = state
                .contexts
                .iter()
                .filter(|(id, entry)| {
                    id.as_str() != DEFAULT_CONTEXT
                        && entry.active_tabs == 0
                        && entry.last_used.elapsed() >= idle_timeout
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in &idle {
                state.contexts.remove(id);
            }
            idle
        };
        for id in idle {
            log::debug!("closing idle context '{id}'");
            self.persist_and_close(&session, &id).await;
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Ok(slot) = self.sweep.get_mut()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }
}

/// Shared handle to the pool. Cloning is cheap.
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

impl BrowserPool {
    pub fn new(config: BrowserPoolConfig, backend: Arc<dyn BrowserBackend>) -> Self {
        let store = config.state_path.clone().map(ContextStore::new);
        Self {
            inner: Arc::new(PoolInner {
                store,
                backend,
                init: tokio::sync::Mutex::new(()),
                context_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(PoolState {
                    mode: BrowserMode::Headless,
                    generation: 0,
                    session: None,
                    active: HashMap::new(),
                    prewarmed: VecDeque::new(),
                    pending: 0,
                    pending_prewarm: 0,
                    contexts: HashMap::new(),
                    consecutive_blocks: 0,
                    mode_switches: 0,
                    tabs_created: 0,
                    tabs_closed: 0,
                    shutting_down: false,
                }),
                sweep: Mutex::new(None),
                config,
            }),
        }
    }

    pub fn config(&self) -> &BrowserPoolConfig {
        &self.inner.config
    }

    /// Launch the engine, start the sweep and wait for the prewarmed tabs.
    pub async fn start(&self) -> Result<(), BrowserError> {
        self.inner.ensure_session().await?;
        self.inner.ensure_sweep();
        self.inner.replenish().await;
        Ok(())
    }

    /// Borrow a tab in `context_id` (the default context when `None`).
    /// Waits, re-checking capacity, until a slot frees up or
    /// `acquire_timeout` passes.
    pub async fn acquire_tab(&self, context_id: Option<&str>) -> Result<ManagedTab, BrowserError> {
        let context_id = context_id.unwrap_or(DEFAULT_CONTEXT).to_string();
        let started = Instant::now();
        self.inner.ensure_sweep();

        loop {
            let (session, generation, launched) = self.inner.ensure_session().await?;
            if launched {
                self.inner.spawn_replenish();
            }
            match self.inner.try_claim(&context_id, generation)? {
                Claim::Prewarmed(tab) => {
                    log::debug!("handing out prewarmed {tab}");
                    self.inner.spawn_replenish();
                    return Ok(self.managed(tab, context_id, generation));
                }
                Claim::Reserved { evicted } => {
                    if let Some(tab) = evicted
                        && let Err(err) = session.close_tab(tab).await
                    {
                        log::warn!("failed to close prewarmed {tab}: {err}");
                    }
                    return self.create_on_demand(session, generation, context_id).await;
                }
                Claim::Full => {
                    let waited = started.elapsed();
                    if waited >= self.inner.config.acquire_timeout {
                        return Err(BrowserError::PoolExhausted { waited });
                    }
                    tokio::time::sleep(self.inner.config.acquire_poll_interval).await;
                }
            }
        }
    }

    async fn create_on_demand(
        &self,
        session: Arc<dyn BrowserSession>,
        generation: u64,
        context_id: String,
    ) -> Result<ManagedTab, BrowserError> {
        let result = self.inner.create_tab(&session, generation, &context_id).await;

        let outcome = {
            let mut state = self.inner.lock_state();
            state.pending -= 1;
            match result {
                Ok(tab) if state.generation == generation && !state.shutting_down => {
                    state.active.insert(
                        tab,
                        ActiveTab {
                            context_id: context_id.clone(),
                        },
                    );
                    state.tabs_created += 1;
                    if let Some(entry) = state.contexts.get_mut(&context_id) {
                        entry.active_tabs += 1;
                        entry.last_used = Instant::now();
                    }
                    Ok(tab)
                }
                Ok(tab) => Err((
                    Some(tab),
                    if state.shutting_down {
                        BrowserError::ShuttingDown
                    } else {
                        BrowserError::Disconnected
                    },
                )),
                Err(err) => Err((None, err)),
            }
        };

        match outcome {
            Ok(tab) => Ok(self.managed(tab, context_id, generation)),
            Err((orphan, err)) => {
                if let Some(tab) = orphan {
                    let _ = session.close_tab(tab).await;
                }
                Err(err)
            }
        }
    }

    fn managed(&self, id: TabId, context_id: String, generation: u64) -> ManagedTab {
        ManagedTab {
            id,
            context_id,
            generation,
            created_at: Instant::now(),
            usage: TabUsage::default(),
            pool: Arc::downgrade(&self.inner),
            released: false,
        }
    }

    /// Return a tab. Healthy default-context tabs refill the prewarmed
    /// queue; everything else is closed.
    pub async fn release(&self, mut tab: ManagedTab) {
        tab.released = true;
        let healthy = !tab.usage.last_failed;
        self.inner
            .release_tab(tab.id, &tab.context_id, tab.generation, healthy)
            .await;
    }

    /// Navigate `tab`, recording usage on it. Worker-reported failures and
    /// empty documents come back as errors.
    pub async fn navigate(
        &self,
        tab: &mut ManagedTab,
        mut request: NavigationRequest,
    ) -> Result<NavigationResponse, BrowserError> {
        request.context_id = tab.context_id.clone();
        let session = {
            let state = self.inner.lock_state();
            if state.generation != tab.generation {
                return Err(BrowserError::StaleTab(tab.id));
            }
            state.session.clone().ok_or(BrowserError::Disconnected)?
        };

        let started = Instant::now();
        let result = session
            .navigate(tab.id, request)
            .await
            .and_then(NavigationResponse::into_checked);
        tab.record(result.is_ok(), started.elapsed());

        match result {
            Err(err) if !session.is_connected() => {
                log::warn!("engine lost during navigation: {err}");
                Err(BrowserError::Disconnected)
            }
            other => other,
        }
    }

    pub fn mode(&self) -> BrowserMode {
        self.inner.lock_state().mode
    }

    /// Extra wait a navigation should grant an interactive challenge.
    pub fn challenge_wait(&self) -> Duration {
        match self.mode() {
            BrowserMode::Headed => self.inner.config.challenge_wait,
            BrowserMode::Headless => Duration::ZERO,
        }
    }

    /// Count a block seen through the engine. Returns whether the pool now
    /// wants to relaunch headed.
    pub fn record_block(&self) -> bool {
        self.inner.lock_state().consecutive_blocks += 1;
        self.should_switch_to_headed()
    }

    pub fn record_success(&self) {
        self.inner.lock_state().consecutive_blocks = 0;
    }

    pub fn should_switch_to_headed(&self) -> bool {
        let state = self.inner.lock_state();
        self.inner.config.allow_headed
            && state.mode == BrowserMode::Headless
            && state.consecutive_blocks >= self.inner.config.headed_switch_after.max(1)
    }

    /// Persist every context, tear the engine down and relaunch headed.
    /// Outstanding tabs become stale.
    pub async fn switch_to_headed(&self) -> Result<(), BrowserError> {
        {
            let _init = self.inner.init.lock().await;
            let _contexts = self.inner.context_lock.lock().await;

            let (session, tabs, contexts) = {
                let state = self.inner.lock_state();
                if state.shutting_down {
                    return Err(BrowserError::ShuttingDown);
                }
                if state.mode == BrowserMode::Headed {
                    return Ok(());
                }
                let tabs: Vec<TabId> = state
                    .active
                    .keys()
                    .copied()
                    .chain(state.prewarmed.iter().copied())
                    .collect();
                let contexts: Vec<String> = state.contexts.keys().cloned().collect();
                (state.session.clone(), tabs, contexts)
            };

            log::info!("switching automation engine to headed mode");
            if let Some(session) = &session {
                for id in &contexts {
                    self.inner.persist_context(session, id).await;
                }
                for tab in tabs {
                    if let Err(err) = session.close_tab(tab).await {
                        log::debug!("failed to close {tab} during mode switch: {err}");
                    }
                }
                for id in &contexts {
                    if let Err(err) = session.close_context(id).await {
                        log::debug!("failed to close context '{id}' during mode switch: {err}");
                    }
                }
                if let Err(err) = session.close().await {
                    log::warn!("failed to close headless engine: {err}");
                }
            }

            let mut state = self.inner.lock_state();
            state.reset();
            state.mode = BrowserMode::Headed;
            state.mode_switches += 1;
            state.consecutive_blocks = 0;
        }

        let (_, _, launched) = self.inner.ensure_session().await?;
        if launched {
            self.inner.spawn_replenish();
        }
        Ok(())
    }

    /// Reclaim idle contexts now instead of waiting for the next tick.
    pub async fn sweep(&self) {
        self.inner.sweep_once().await;
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock_state();
        let open_tabs = state.open_tabs();
        PoolStats {
            mode: state.mode,
            running: state
                .session
                .as_ref()
                .is_some_and(|session| session.is_connected()),
            generation: state.generation,
            active_tabs: state.active.len(),
            prewarmed_tabs: state.prewarmed.len(),
            pending_tabs: state.pending,
            open_tabs,
            max_tabs: self.inner.config.max_tabs,
            contexts: state.contexts.len(),
            utilization: state.active.len() as f64 / self.inner.config.max_tabs.max(1) as f64,
            consecutive_blocks: state.consecutive_blocks,
            mode_switches: state.mode_switches,
            tabs_created: state.tabs_created,
            tabs_closed: state.tabs_closed,
        }
    }

    /// Best-effort ordered teardown: stop the sweep, close every tab,
    /// persist and close every context, close the engine, clear the maps.
    pub async fn shutdown(&self) {
        let sweep = self.inner.sweep.lock().expect("sweep handle poisoned").take();
        if let Some(handle) = sweep {
            handle.abort();
        }

        let _init = self.inner.init.lock().await;
        let _contexts = self.inner.context_lock.lock().await;

        let (session, tabs, contexts) = {
            let mut state = self.inner.lock_state();
            state.shutting_down = true;
            let tabs: Vec<TabId> = state
                .active
                .keys()
                .copied()
                .chain(state.prewarmed.iter().copied())
                .collect();
            let contexts: Vec<String> = state.contexts.keys().cloned().collect();
            (state.session.take(), tabs, contexts)
        };

        if let Some(session) = &session {
            for tab in tabs {
                if let Err(err) = session.close_tab(tab).await {
                    log::warn!("shutdown: failed to close {tab}: {err}");
                }
            }
            for id in &contexts {
                self.inner.persist_and_close(session, id).await;
            }
            if let Err(err) = session.close().await {
                log::warn!("shutdown: failed to close engine: {err}");
            }
        }

        let mut state = self.inner.lock_state();
        state.reset();
        log::info!("browser pool shut down");
    }
}

impl std::fmt::Debug for BrowserPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        launches: AtomicUsize,
        headed_launches: AtomicUsize,
    }

    struct FakeBackend {
        counters: Arc<Counters>,
    }

    struct FakeSession {
        mode: BrowserMode,
        connected: AtomicBool,
        next: AtomicU64,
        tabs: Mutex<HashMap<TabId, String>>,
        contexts: Mutex<HashMap<String, ContextSnapshot>>,
    }

    #[async_trait]
    impl BrowserBackend for FakeBackend {
        async fn launch(&self, mode: BrowserMode) -> Result<Box<dyn BrowserSession>, BrowserError> {
            self.counters.launches.fetch_add(1, Ordering::SeqCst);
            if mode == BrowserMode::Headed {
                self.counters.headed_launches.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Box::new(FakeSession {
                mode,
                connected: AtomicBool::new(true),
                next: AtomicU64::new(1),
                tabs: Mutex::new(HashMap::new()),
                contexts: Mutex::new(HashMap::new()),
            }))
        }
    }

    #[async_trait]
    impl BrowserSession for FakeSession {
        fn mode(&self) -> BrowserMode {
            self.mode
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        async fn create_context(&self, id: &str, snapshot: Option<ContextSnapshot>) -> Result<(), BrowserError> {
            self.contexts.lock().unwrap().insert(id.to_string(), snapshot.unwrap_or_default());
            Ok(())
        }
        async fn create_tab(&self, context_id: &str) -> Result<TabId, BrowserError> {
            let tab = TabId(self.next.fetch_add(1, Ordering::SeqCst));
            self.tabs.lock().unwrap().insert(tab, context_id.to_string());
            Ok(tab)
        }
        async fn navigate(&self, _tab: TabId, request: NavigationRequest) -> Result<NavigationResponse, BrowserError> {
            Ok(NavigationResponse {
                ok: true,
                status: Some(200),
                final_url: Some(request.url),
                html: "<html><body>ok</body></html>".into(),
                ..NavigationResponse::default()
            })
        }
        async fn close_tab(&self, tab: TabId) -> Result<(), BrowserError> {
            self.tabs.lock().unwrap().remove(&tab);
            Ok(())
        }
        async fn export_context(&self, id: &str) -> Result<ContextSnapshot, BrowserError> {
            Ok(self.contexts.lock().unwrap().get(id).cloned().unwrap_or_default())
        }
        async fn close_context(&self, id: &str) -> Result<(), BrowserError> {
            self.contexts.lock().unwrap().remove(id);
            Ok(())
        }
        async fn close(&self) -> Result<(), BrowserError> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool(config: BrowserPoolConfig) -> (BrowserPool, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let backend = Arc::new(FakeBackend {
            counters: counters.clone(),
        });
        (BrowserPool::new(config, backend), counters)
    }

    #[tokio::test]
    async fn concurrent_acquisitions_launch_one_engine() {
        let (pool, counters) = pool(BrowserPoolConfig {
            prewarm_tabs: 0,
            ..BrowserPoolConfig::default()
        });
        let tabs = futures::future::join_all((0..4).map(|_| pool.acquire_tab(None))).await;
        assert!(tabs.iter().all(Result::is_ok));
        assert_eq!(counters.launches.load(Ordering::SeqCst), 1);
        for tab in tabs {
            pool.release(tab.unwrap()).await;
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn prewarmed_tabs_are_handed_out_first() {
        let (pool, _) = pool(BrowserPoolConfig::default());
        pool.start().await.unwrap();
        assert_eq!(pool.stats().prewarmed_tabs, 2);

        let tab = pool.acquire_tab(None).await.unwrap();
        assert!(tab.id().0 <= 2);
        pool.release(tab).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_blocks_switch_to_headed() {
        let (pool, counters) = pool(BrowserPoolConfig {
            prewarm_tabs: 0,
            ..BrowserPoolConfig::default()
        });
        let mut tab = pool.acquire_tab(None).await.unwrap();
        assert!(!pool.record_block());
        assert!(pool.record_block());

        pool.switch_to_headed().await.unwrap();
        assert_eq!(pool.mode(), BrowserMode::Headed);
        assert_eq!(pool.challenge_wait(), Duration::from_secs(120));
        assert_eq!(counters.headed_launches.load(Ordering::SeqCst), 1);
        assert!(!pool.should_switch_to_headed());

        let request = NavigationRequest::new(
            &url::Url::parse("https://example.com/").unwrap(),
            Duration::from_secs(5),
        );
        let err = pool.navigate(&mut tab, request).await.unwrap_err();
        assert!(matches!(err, BrowserError::StaleTab(_)));
        pool.release(tab).await;
        assert_eq!(pool.stats().active_tabs, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn acquisition_after_shutdown_is_refused() {
        let (pool, _) = pool(BrowserPoolConfig::default());
        pool.shutdown().await;
        let err = pool.acquire_tab(None).await.unwrap_err();
        assert!(matches!(err, BrowserError::ShuttingDown));
    }
}
