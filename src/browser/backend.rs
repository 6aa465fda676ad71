//! Automation-engine backends.
//!
//! A [`BrowserBackend`] launches sessions; a [`BrowserSession`] owns one
//! running engine and exposes contexts and tabs to the pool. The production
//! [`ProcessBackend`] keeps a Chromium process alive with remote debugging
//! enabled and drives every navigation through a separate worker process.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;

use super::BrowserError;
use super::state::ContextSnapshot;
use super::worker::{NavigationRequest, NavigationResponse, WorkerCommand};

static DEVTOOLS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"DevTools listening on (ws://\S+)").expect("invalid devtools regex")
});

/// Whether the engine renders a visible window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserMode {
    #[default]
    Headless,
    Headed,
}

impl fmt::Display for BrowserMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrowserMode::Headless => f.write_str("headless"),
            BrowserMode::Headed => f.write_str("headed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TabId(pub u64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab-{}", self.0)
    }
}

/// Launches automation-engine sessions.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    async fn launch(&self, mode: BrowserMode) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

/// One running automation engine.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    fn mode(&self) -> BrowserMode;

    fn is_connected(&self) -> bool;

    async fn create_context(
        &self,
        context_id: &str,
        snapshot: Option<ContextSnapshot>,
    ) -> Result<(), BrowserError>;

    async fn create_tab(&self, context_id: &str) -> Result<TabId, BrowserError>;

    async fn navigate(
        &self,
        tab: TabId,
        request: NavigationRequest,
    ) -> Result<NavigationResponse, BrowserError>;

    async fn close_tab(&self, tab: TabId) -> Result<(), BrowserError>;

    /// Current cookies and storage of a context.
    async fn export_context(&self, context_id: &str) -> Result<ContextSnapshot, BrowserError>;

    async fn close_context(&self, context_id: &str) -> Result<(), BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProcessBackendConfig {
    pub browser_program: String,
    pub browser_args: Vec<String>,
    pub worker: WorkerCommand,
    /// Time allowed for the engine to announce its debugging endpoint.
    #[serde(with = "crate::config::duration_ms")]
    pub launch_timeout: Duration,
    /// Slack on top of a navigation's own budget before the worker is killed.
    #[serde(with = "crate::config::duration_ms")]
    pub worker_grace: Duration,
    /// Parent of per-session profile directories; the system temp dir when unset.
    pub profile_root: Option<PathBuf>,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        Self {
            browser_program: std::env::var("SEARCHGUARD_CHROMIUM")
                .unwrap_or_else(|_| "chromium".to_string()),
            browser_args: Vec::new(),
            worker: WorkerCommand::default(),
            launch_timeout: Duration::from_secs(20),
            worker_grace: Duration::from_secs(10),
            profile_root: None,
        }
    }
}

/// Chromium plus per-navigation Playwright workers.
#[derive(Debug, Clone, Default)]
pub struct ProcessBackend {
    config: ProcessBackendConfig,
}

impl ProcessBackend {
    pub fn new(config: ProcessBackendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessBackendConfig {
        &self.config
    }
}

impl ProcessBackend {
    /// Spawn the engine and wait for its debugging endpoint.
    async fn start_engine(
        &self,
        mode: BrowserMode,
        profile_dir: &Path,
    ) -> Result<(Child, String), BrowserError> {
        let mut command = tokio::process::Command::new(&self.config.browser_program);
        command
            .arg("--remote-debugging-port=0")
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if mode == BrowserMode::Headless {
            command.arg("--headless=new");
        }
        command
            .args(&self.config.browser_args)
            .arg("about:blank")
            .kill_on_drop(true)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped());

        let mut child = command.spawn().map_err(|err| {
            BrowserError::Launch(format!(
                "could not start '{}': {err}",
                self.config.browser_program
            ))
        })?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BrowserError::Launch("engine stderr not captured".to_string()))?;

        let mut lines = BufReader::new(stderr).lines();
        let announce = async {
            while let Some(line) = lines.next_line().await? {
                if let Some(caps) = DEVTOOLS_RE.captures(&line) {
                    return Ok::<_, std::io::Error>(Some(caps[1].to_string()));
                }
                log::trace!("engine: {line}");
            }
            Ok(None)
        };

        let endpoint = match tokio::time::timeout(self.config.launch_timeout, announce).await {
            Ok(Ok(Some(endpoint))) => endpoint,
            Ok(Ok(None)) => {
                let _ = child.kill().await;
                return Err(BrowserError::Launch(
                    "engine exited before announcing a debugging endpoint".to_string(),
                ));
            }
            Ok(Err(err)) => {
                let _ = child.kill().await;
                return Err(err.into());
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(BrowserError::Launch(format!(
                    "engine did not announce a debugging endpoint within {:?}",
                    self.config.launch_timeout
                )));
            }
        };

        // Keep draining stderr so the engine never blocks on a full pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                log::trace!("engine: {line}");
            }
        });
        Ok((child, endpoint))
    }
}

#[async_trait]
impl BrowserBackend for ProcessBackend {
    async fn launch(&self, mode: BrowserMode) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let root = self
            .config
            .profile_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let profile_dir = root.join(format!(
            "searchguard-profile-{}-{:08x}",
            std::process::id(),
            rand::thread_rng().r#gen::<u32>()
        ));
        tokio::fs::create_dir_all(&profile_dir).await?;

        let (child, endpoint) = match self.start_engine(mode, &profile_dir).await {
            Ok(started) => started,
            Err(err) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&profile_dir).await {
                    log::debug!("could not remove profile {}: {cleanup}", profile_dir.display());
                }
                return Err(err);
            }
        };

        log::info!("launched {mode} engine at {endpoint}");
        Ok(Box::new(ProcessSession {
            mode,
            cdp_endpoint: endpoint,
            worker: self.config.worker.clone(),
            grace: self.config.worker_grace,
            profile_dir,
            child: Mutex::new(Some(child)),
            contexts: Mutex::new(HashMap::new()),
            tabs: Mutex::new(HashMap::new()),
            next_tab: AtomicU64::new(1),
        }))
    }
}

/// Contexts are tracked by the supervisor as storage snapshots that every
/// worker replays, so nothing but the engine itself outlives a navigation.
struct ProcessSession {
    mode: BrowserMode,
    cdp_endpoint: String,
    worker: WorkerCommand,
    grace: Duration,
    profile_dir: PathBuf,
    child: Mutex<Option<Child>>,
    contexts: Mutex<HashMap<String, ContextSnapshot>>,
    tabs: Mutex<HashMap<TabId, String>>,
    next_tab: AtomicU64,
}

impl ProcessSession {
    fn context_of(&self, tab: TabId) -> Result<String, BrowserError> {
        self.tabs
            .lock()
            .expect("tab map lock poisoned")
            .get(&tab)
            .cloned()
            .ok_or(BrowserError::UnknownTab(tab))
    }
}

#[async_trait]
impl BrowserSession for ProcessSession {
    fn mode(&self) -> BrowserMode {
        self.mode
    }

    fn is_connected(&self) -> bool {
        let mut guard = self.child.lock().expect("engine child lock poisoned");
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn create_context(
        &self,
        context_id: &str,
        snapshot: Option<ContextSnapshot>,
    ) -> Result<(), BrowserError> {
        let mut contexts = self.contexts.lock().expect("context map lock poisoned");
        contexts.insert(context_id.to_string(), snapshot.unwrap_or_default());
        Ok(())
    }

    async fn create_tab(&self, context_id: &str) -> Result<TabId, BrowserError> {
        if !self
            .contexts
            .lock()
            .expect("context map lock poisoned")
            .contains_key(context_id)
        {
            return Err(BrowserError::UnknownContext(context_id.to_string()));
        }
        let tab = TabId(self.next_tab.fetch_add(1, Ordering::Relaxed));
        self.tabs
            .lock()
            .expect("tab map lock poisoned")
            .insert(tab, context_id.to_string());
        Ok(tab)
    }

    async fn navigate(
        &self,
        tab: TabId,
        mut request: NavigationRequest,
    ) -> Result<NavigationResponse, BrowserError> {
        if !self.is_connected() {
            return Err(BrowserError::Disconnected);
        }
        let context_id = self.context_of(tab)?;
        request.context_id = context_id.clone();
        request.headless = self.mode == BrowserMode::Headless;
        request.cdp_endpoint = Some(self.cdp_endpoint.clone());
        request.storage_state = self
            .contexts
            .lock()
            .expect("context map lock poisoned")
            .get(&context_id)
            .filter(|snapshot| !snapshot.is_empty())
            .cloned();

        let hard_timeout = request.budget() + self.grace;
        let response = self.worker.run(&request, hard_timeout).await?;

        if let Some(state) = response.storage_state.clone() {
            let mut contexts = self.contexts.lock().expect("context map lock poisoned");
            if let Some(slot) = contexts.get_mut(&context_id) {
                *slot = state;
            }
        }
        Ok(response)
    }

    async fn close_tab(&self, tab: TabId) -> Result<(), BrowserError> {
        self.tabs
            .lock()
            .expect("tab map lock poisoned")
            .remove(&tab)
            .map(|_| ())
            .ok_or(BrowserError::UnknownTab(tab))
    }

    async fn export_context(&self, context_id: &str) -> Result<ContextSnapshot, BrowserError> {
        self.contexts
            .lock()
            .expect("context map lock poisoned")
            .get(context_id)
            .cloned()
            .ok_or_else(|| BrowserError::UnknownContext(context_id.to_string()))
    }

    async fn close_context(&self, context_id: &str) -> Result<(), BrowserError> {
        self.tabs
            .lock()
            .expect("tab map lock poisoned")
            .retain(|_, owner| owner != context_id);
        self.contexts
            .lock()
            .expect("context map lock poisoned")
            .remove(context_id)
            .map(|_| ())
            .ok_or_else(|| BrowserError::UnknownContext(context_id.to_string()))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let child = self.child.lock().expect("engine child lock poisoned").take();
        if let Some(mut child) = child {
            if let Err(err) = child.kill().await {
                log::warn!("failed to kill {} engine: {err}", self.mode);
            }
            let _ = child.wait().await;
        }
        self.tabs.lock().expect("tab map lock poisoned").clear();
        self.contexts.lock().expect("context map lock poisoned").clear();
        if let Err(err) = tokio::fs::remove_dir_all(&self.profile_dir).await {
            log::debug!("could not remove profile {}: {err}", self.profile_dir.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_devtools_endpoint() {
        let line = "DevTools listening on ws://127.0.0.1:36411/devtools/browser/7c1e";
        let caps = DEVTOOLS_RE.captures(line).unwrap();
        assert_eq!(&caps[1], "ws://127.0.0.1:36411/devtools/browser/7c1e");
    }

    fn profile_entries(root: &Path) -> usize {
        std::fs::read_dir(root).unwrap().count()
    }

    #[tokio::test]
    async fn missing_engine_binary_is_a_launch_error() {
        let profiles = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::new(ProcessBackendConfig {
            browser_program: "/nonexistent/chromium".to_string(),
            profile_root: Some(profiles.path().to_path_buf()),
            ..ProcessBackendConfig::default()
        });
        let err = backend.launch(BrowserMode::Headless).await.err().unwrap();
        assert!(matches!(err, BrowserError::Launch(_)));
        assert_eq!(profile_entries(profiles.path()), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn engine_that_never_announces_times_out() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("silent-engine");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let profiles = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::new(ProcessBackendConfig {
            browser_program: script.display().to_string(),
            launch_timeout: Duration::from_millis(200),
            profile_root: Some(profiles.path().to_path_buf()),
            ..ProcessBackendConfig::default()
        });
        let err = backend.launch(BrowserMode::Headless).await.err().unwrap();
        assert!(matches!(err, BrowserError::Launch(msg) if msg.contains("did not announce")));
        assert_eq!(profile_entries(profiles.path()), 0);
    }
}
