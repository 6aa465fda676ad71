use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use searchguard_rs::browser::{
    BrowserBackend, BrowserError, BrowserMode, BrowserPool, BrowserPoolConfig, BrowserSession,
    ContextSnapshot, NavigationRequest, NavigationResponse, StoredCookie, TabId,
};
use url::Url;

/// Engine state shared by every session the fake backend launches.
#[derive(Default)]
struct Engine {
    launches: AtomicUsize,
    next_tab: AtomicU64,
    open_tabs: Mutex<HashSet<TabId>>,
    max_open_tabs: AtomicUsize,
    contexts: Mutex<HashMap<String, ContextSnapshot>>,
    restored: Mutex<Vec<(String, Option<ContextSnapshot>)>>,
}

impl Engine {
    fn open_tabs(&self) -> usize {
        self.open_tabs.lock().unwrap().len()
    }

    fn open_contexts(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }
}

struct FakeBackend {
    engine: Arc<Engine>,
}

struct FakeSession {
    mode: BrowserMode,
    engine: Arc<Engine>,
}

#[async_trait]
impl BrowserBackend for FakeBackend {
    async fn launch(&self, mode: BrowserMode) -> Result<Box<dyn BrowserSession>, BrowserError> {
        self.engine.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            mode,
            engine: self.engine.clone(),
        }))
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    fn mode(&self) -> BrowserMode {
        self.mode
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn create_context(
        &self,
        context_id: &str,
        snapshot: Option<ContextSnapshot>,
    ) -> Result<(), BrowserError> {
        self.engine
            .restored
            .lock()
            .unwrap()
            .push((context_id.to_string(), snapshot.clone()));
        self.engine
            .contexts
            .lock()
            .unwrap()
            .insert(context_id.to_string(), snapshot.unwrap_or_default());
        Ok(())
    }

    async fn create_tab(&self, _context_id: &str) -> Result<TabId, BrowserError> {
        tokio::task::yield_now().await;
        let tab = TabId(self.engine.next_tab.fetch_add(1, Ordering::SeqCst));
        let mut open = self.engine.open_tabs.lock().unwrap();
        open.insert(tab);
        self.engine.max_open_tabs.fetch_max(open.len(), Ordering::SeqCst);
        Ok(tab)
    }

    async fn navigate(
        &self,
        _tab: TabId,
        request: NavigationRequest,
    ) -> Result<NavigationResponse, BrowserError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let host = Url::parse(&request.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_default();
        if let Some(snapshot) = self.engine.contexts.lock().unwrap().get_mut(&request.context_id) {
            snapshot.cookies.push(StoredCookie {
                name: "session".into(),
                value: "abc123".into(),
                domain: host,
                path: "/".into(),
                expires: -1.0,
                ..StoredCookie::default()
            });
        }
        Ok(NavigationResponse {
            ok: true,
            status: Some(200),
            final_url: Some(request.url),
            html: "<html><head><title>ok</title></head><body>rendered</body></html>".into(),
            title: Some("ok".into()),
            ..NavigationResponse::default()
        })
    }

    async fn close_tab(&self, tab: TabId) -> Result<(), BrowserError> {
        self.engine.open_tabs.lock().unwrap().remove(&tab);
        Ok(())
    }

    async fn export_context(&self, context_id: &str) -> Result<ContextSnapshot, BrowserError> {
        self.engine
            .contexts
            .lock()
            .unwrap()
            .get(context_id)
            .cloned()
            .ok_or_else(|| BrowserError::UnknownContext(context_id.to_string()))
    }

    async fn close_context(&self, context_id: &str) -> Result<(), BrowserError> {
        self.engine.contexts.lock().unwrap().remove(context_id);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.engine.open_tabs.lock().unwrap().clear();
        self.engine.contexts.lock().unwrap().clear();
        Ok(())
    }
}

fn pool_with(engine: &Arc<Engine>, config: BrowserPoolConfig) -> BrowserPool {
    BrowserPool::new(
        config,
        Arc::new(FakeBackend {
            engine: engine.clone(),
        }),
    )
}

fn small_config() -> BrowserPoolConfig {
    BrowserPoolConfig {
        max_tabs: 3,
        prewarm_tabs: 2,
        acquire_poll_interval: Duration::from_millis(2),
        acquire_timeout: Duration::from_secs(10),
        ..BrowserPoolConfig::default()
    }
}

#[tokio::test]
async fn open_tabs_never_exceed_max_tabs() {
    let engine = Arc::new(Engine::default());
    let pool = pool_with(&engine, small_config());
    pool.start().await.unwrap();
    assert_eq!(pool.stats().prewarmed_tabs, 2);

    let workers = (0..12).map(|i| {
        let pool = pool.clone();
        async move {
            let context = if i % 3 == 0 { Some("research") } else { None };
            for _ in 0..4 {
                let mut tab = pool.acquire_tab(context).await.unwrap();
                let stats = pool.stats();
                assert!(stats.open_tabs <= stats.max_tabs, "{stats:?}");
                let url = Url::parse("https://docs.example/page").unwrap();
                pool.navigate(&mut tab, NavigationRequest::new(&url, Duration::from_secs(5)))
                    .await
                    .unwrap();
                pool.release(tab).await;
            }
        }
    });
    join_all(workers).await;

    assert!(engine.max_open_tabs.load(Ordering::SeqCst) <= 3);
    assert_eq!(engine.launches.load(Ordering::SeqCst), 1);
    let stats = pool.stats();
    assert_eq!(stats.active_tabs, 0);
    assert!(stats.tabs_created >= 3);
}

#[tokio::test]
async fn shutdown_leaves_nothing_open() {
    let engine = Arc::new(Engine::default());
    let pool = pool_with(&engine, small_config());

    let first = pool.acquire_tab(None).await.unwrap();
    let second = pool.acquire_tab(Some("checkout")).await.unwrap();
    assert_eq!(second.context_id(), "checkout");
    pool.release(first).await;
    // Let the replenishment spawned by the hand-outs settle.
    tokio::time::sleep(Duration::from_millis(50)).await;

    drop(second);
    pool.shutdown().await;

    let stats = pool.stats();
    assert_eq!(stats.open_tabs, 0);
    assert_eq!(stats.contexts, 0);
    assert!(!stats.running);
    assert_eq!(engine.open_tabs(), 0);
    assert_eq!(engine.open_contexts(), 0);

    let refused = pool.acquire_tab(None).await;
    assert!(matches!(refused, Err(BrowserError::ShuttingDown)));
}

#[tokio::test]
async fn context_state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = BrowserPoolConfig {
        state_path: Some(dir.path().join("state").join("browser.json")),
        ..small_config()
    };

    let engine = Arc::new(Engine::default());
    let pool = pool_with(&engine, config.clone());
    let mut tab = pool.acquire_tab(Some("work")).await.unwrap();
    let url = Url::parse("https://accounts.example/login").unwrap();
    pool.navigate(&mut tab, NavigationRequest::new(&url, Duration::from_secs(5)))
        .await
        .unwrap();
    pool.release(tab).await;
    pool.shutdown().await;
    assert!(dir.path().join("state").join("browser-work.json").exists());

    let engine = Arc::new(Engine::default());
    let pool = pool_with(&engine, config);
    let tab = pool.acquire_tab(Some("work")).await.unwrap();
    pool.release(tab).await;

    let restored = engine.restored.lock().unwrap().clone();
    let (_, snapshot) = restored
        .iter()
        .find(|(id, _)| id == "work")
        .expect("work context was created");
    let snapshot = snapshot.as_ref().expect("snapshot restored from disk");
    assert_eq!(snapshot.cookies.len(), 1);
    assert_eq!(snapshot.cookies[0].domain, "accounts.example");
    assert!(snapshot.saved_at.is_some());
    pool.shutdown().await;
}

#[tokio::test]
async fn repeated_blocks_relaunch_headed() {
    let engine = Arc::new(Engine::default());
    let pool = pool_with(&engine, small_config());
    let stale = pool.acquire_tab(None).await.unwrap();

    assert!(!pool.record_block());
    assert!(pool.record_block());
    pool.switch_to_headed().await.unwrap();

    assert_eq!(pool.mode(), BrowserMode::Headed);
    assert_eq!(pool.challenge_wait(), Duration::from_secs(120));
    assert_eq!(engine.launches.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().mode_switches, 1);

    let mut stale = stale;
    let url = Url::parse("https://example.com/").unwrap();
    let err = pool
        .navigate(&mut stale, NavigationRequest::new(&url, Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, BrowserError::StaleTab(_)));
    pool.release(stale).await;
    pool.shutdown().await;
}
