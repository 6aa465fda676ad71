//! Navigation worker protocol.
//!
//! Each navigation is a short-lived child process: one JSON request on stdin,
//! one JSON response on stdout. The supervisor owns the wall clock and kills
//! the child when it runs past the hard deadline.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use url::Url;

use super::BrowserError;
use super::state::ContextSnapshot;
use crate::core::OutputFormat;

/// Request envelope written to the worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationRequest {
    pub url: String,
    pub format: OutputFormat,
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    pub readability: bool,
    pub headless: bool,
    pub context_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdp_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_state: Option<ContextSnapshot>,
    /// How long to wait for an interactive challenge to navigate away.
    #[serde(default)]
    pub wait_for_challenge_ms: u64,
}

impl NavigationRequest {
    pub fn new(url: &Url, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            format: OutputFormat::default(),
            timeout_ms: timeout.as_millis().min(u64::MAX as u128) as u64,
            max_length: None,
            readability: true,
            headless: true,
            context_id: super::DEFAULT_CONTEXT.to_string(),
            cdp_endpoint: None,
            storage_state: None,
            wait_for_challenge_ms: 0,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_max_length(mut self, max_length: Option<usize>) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_readability(mut self, readability: bool) -> Self {
        self.readability = readability;
        self
    }

    pub fn with_challenge_wait(mut self, wait: Duration) -> Self {
        self.wait_for_challenge_ms = wait.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    /// Worker budget: navigation timeout plus any challenge wait.
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.saturating_add(self.wait_for_challenge_ms))
    }
}

/// Response envelope read from the worker's stdout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NavigationResponse {
    pub ok: bool,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub final_url: Option<String>,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub storage_state: Option<ContextSnapshot>,
    #[serde(default)]
    pub error: Option<String>,
}

impl NavigationResponse {
    /// Turn a worker-reported failure (or an empty document) into an error.
    pub fn into_checked(self) -> Result<Self, BrowserError> {
        if !self.ok {
            return Err(BrowserError::Navigation(
                self.error
                    .unwrap_or_else(|| "navigation failed without diagnostics".to_string()),
            ));
        }
        if self.html.trim().is_empty() {
            return Err(BrowserError::Navigation("worker returned empty HTML".to_string()));
        }
        Ok(self)
    }
}

/// How to start a navigation worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::node()
    }
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
        }
    }

    /// Node.js running the bundled Playwright script.
    pub fn node() -> Self {
        let program = std::env::var("SEARCHGUARD_NODE").unwrap_or_else(|_| "node".to_string());
        Self::new(program, vec!["-e".to_string(), WORKER_SCRIPT.to_string()])
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run one navigation. `hard_timeout` bounds the whole exchange,
    /// independent of the worker's own navigation timeout.
    pub async fn run(
        &self,
        request: &NavigationRequest,
        hard_timeout: Duration,
    ) -> Result<NavigationResponse, BrowserError> {
        let payload = serde_json::to_vec(request)?;

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|err| BrowserError::Launch(format!("could not start worker '{}': {err}", self.program)))?;

        // Written concurrently so a worker that never drains stdin still
        // falls under the hard deadline.
        let stdin = child.stdin.take();
        let stdin_task = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                // A worker that exits early closes the pipe; the exit status tells the story.
                let _ = stdin.write_all(&payload).await;
                let _ = stdin.shutdown().await;
            }
        });

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrowserError::Protocol("worker stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| BrowserError::Protocol("worker stderr not captured".to_string()))?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut buf).await;
            buf
        });

        let waited = tokio::time::timeout(hard_timeout, child.wait()).await;
        stdin_task.abort();
        let status = match waited {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                log::warn!("navigation worker for {} killed after {hard_timeout:?}", request.url);
                return Err(BrowserError::WorkerTimeout(hard_timeout));
            }
        };

        let out = stdout_task.await.unwrap_or_default();
        let err = stderr_task.await.unwrap_or_default();
        let stdout = String::from_utf8_lossy(&out);
        let stderr = String::from_utf8_lossy(&err).trim().to_string();

        match serde_json::from_str::<NavigationResponse>(stdout.trim()) {
            Ok(response) => {
                if !status.success() {
                    log::debug!("worker exited with {status} but produced a response");
                }
                Ok(response)
            }
            Err(_) if !status.success() => Err(BrowserError::WorkerFailed {
                code: status.code(),
                stderr,
            }),
            Err(parse) if stderr.is_empty() => Err(BrowserError::Protocol(format!(
                "worker returned invalid JSON: {parse}"
            ))),
            Err(parse) => Err(BrowserError::Protocol(format!(
                "worker returned invalid JSON: {parse}. stderr: {stderr}"
            ))),
        }
    }
}

/// Playwright worker. Connects to the supervised browser over CDP when an
/// endpoint is given, otherwise launches its own.
pub const WORKER_SCRIPT: &str = r#"
const fs = require('fs');

function out(obj) { process.stdout.write(JSON.stringify(obj)); }
function fail(message) { out({ ok: false, error: message }); }

const CHALLENGE = [
  'iframe[src*="captcha"]', 'iframe[src*="challenges.cloudflare.com"]',
  '.g-recaptcha', '.h-captcha', '.cf-turnstile', '#challenge-form'
];

async function main() {
  let req;
  try { req = JSON.parse(fs.readFileSync(0, 'utf8')); } catch (e) { return fail('bad request JSON'); }

  let pw;
  try { pw = require('playwright'); } catch (e) { return fail('playwright is not installed for node'); }

  const timeout = Number(req.timeout_ms || 20000);
  let browser;
  let context;
  try {
    if (req.cdp_endpoint) {
      browser = await pw.chromium.connectOverCDP(req.cdp_endpoint);
    } else {
      browser = await pw.chromium.launch({ headless: req.headless !== false });
    }
    const opts = {};
    if (req.storage_state) opts.storageState = req.storage_state;
    context = await browser.newContext(opts);
    const page = await context.newPage();
    const resp = await page.goto(req.url, { waitUntil: 'domcontentloaded', timeout });
    try { await page.waitForLoadState('networkidle', { timeout: Math.min(5000, timeout) }); } catch (_) {}

    const wait = Number(req.wait_for_challenge_ms || 0);
    if (wait > 0) {
      const start = page.url();
      try {
        await page.waitForFunction(
          ([sel, start]) => location.href !== start || !sel.some((s) => document.querySelector(s)),
          [CHALLENGE, start],
          { timeout: wait, polling: 500 }
        );
      } catch (_) {}
    }

    let html = await page.content();
    if (req.max_length && html.length > req.max_length) html = html.slice(0, req.max_length);
    const storage_state = await context.storageState();
    out({
      ok: true,
      status: resp ? resp.status() : null,
      final_url: page.url(),
      html,
      title: await page.title(),
      storage_state
    });
  } catch (e) {
    fail(String(e && e.message ? e.message : e));
  } finally {
    try { if (context) await context.close(); } catch (_) {}
    try { if (browser) await browser.close(); } catch (_) {}
  }
}

main().catch((e) => fail(String(e && e.message ? e.message : e)));
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> NavigationRequest {
        NavigationRequest::new(
            &Url::parse("https://example.com/").unwrap(),
            Duration::from_secs(5),
        )
    }

    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn request_serializes_flat_envelope() {
        let value = serde_json::to_value(request().with_max_length(Some(1000))).unwrap();
        assert_eq!(value["url"], "https://example.com/");
        assert_eq!(value["format"], "markdown");
        assert_eq!(value["timeout_ms"], 5000);
        assert_eq!(value["max_length"], 1000);
        assert_eq!(value["context_id"], "default");
        assert!(value.get("cdp_endpoint").is_none());
    }

    #[test]
    fn failed_or_empty_responses_are_errors() {
        let failed = NavigationResponse {
            ok: false,
            error: Some("net::ERR_NAME_NOT_RESOLVED".into()),
            ..NavigationResponse::default()
        };
        assert!(matches!(failed.into_checked(), Err(BrowserError::Navigation(msg)) if msg.contains("NAME_NOT_RESOLVED")));
        let empty = NavigationResponse {
            ok: true,
            html: "  ".into(),
            ..NavigationResponse::default()
        };
        assert!(empty.into_checked().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reads_one_json_object_from_stdout() {
        let worker = shell(r#"cat >/dev/null; printf '{"ok":true,"status":200,"final_url":"https://example.com/","html":"<html></html>"}'"#);
        let response = worker.run(&request(), Duration::from_secs(5)).await.unwrap();
        assert!(response.ok);
        assert_eq!(response.status, Some(200));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_surfaces_stderr() {
        let worker = shell("cat >/dev/null; echo 'engine crashed' >&2; exit 3");
        let err = worker.run(&request(), Duration::from_secs(5)).await.unwrap_err();
        match err {
            BrowserError::WorkerFailed { code, stderr } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("engine crashed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_worker_is_killed_at_the_hard_timeout() {
        let worker = shell("sleep 10");
        let started = std::time::Instant::now();
        let err = worker
            .run(&request(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::WorkerTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_that_never_reads_stdin_still_times_out() {
        // Far larger than a pipe buffer, so the write cannot complete.
        let mut request = request();
        request.context_id = "x".repeat(1 << 20);
        let worker = shell("sleep 5");
        let started = std::time::Instant::now();
        let err = worker
            .run(&request, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::WorkerTimeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_failure() {
        let worker = WorkerCommand::new("/nonexistent/searchguard-worker", Vec::new());
        let err = worker.run(&request(), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, BrowserError::Launch(_)));
    }
}
