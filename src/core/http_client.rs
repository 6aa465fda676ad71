//! Plain HTTP transport used for backend searches and page fetches.
//!
//! The orchestrator talks to the [`PageHttpClient`] trait so the transport can
//! be swapped in tests; [`ReqwestPageClient`] is the production adapter around
//! `reqwest::Client`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::Client;
use thiserror::Error;
use url::Url;

/// Connect-phase failures faster than this are reported as early timeouts.
pub const EARLY_FAILURE_WINDOW: Duration = Duration::from_secs(1);

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
    pub elapsed: Duration,
}

impl HttpResponse {
    /// Lossy UTF-8 view of the body.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// `Retry-After` as either delta-seconds or an HTTP date.
    ///
    /// Hints too large for a [`Duration`] saturate; the retry policy caps the
    /// actual wait at its maximum backoff.
    pub fn retry_after(&self) -> Option<Duration> {
        let raw = self.headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
        if let Ok(seconds) = raw.parse::<f64>()
            && seconds.is_finite()
            && seconds >= 0.0
        {
            return Some(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX));
        }

        DateTime::parse_from_rfc2822(raw)
            .or_else(|_| DateTime::parse_from_rfc3339(raw))
            .ok()
            .and_then(|date| (date.with_timezone(&Utc) - Utc::now()).to_std().ok())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed after {elapsed:?}: {message}")]
    Connect { elapsed: Duration, message: String },
    #[error("http transport error: {0}")]
    Other(String),
}

/// Contract for the plain HTTP path.
#[async_trait]
pub trait PageHttpClient: Send + Sync {
    async fn get(&self, url: &Url, timeout: Duration) -> Result<HttpResponse, TransportError>;
}

/// Reqwest-backed client with browser-like default headers and a cookie jar.
pub struct ReqwestPageClient {
    client: Client,
}

impl ReqwestPageClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_user_agent(DEFAULT_USER_AGENT)
    }

    pub fn with_user_agent(user_agent: &str) -> Result<Self, reqwest::Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(value) = reqwest::header::HeaderValue::from_str(user_agent) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static(DEFAULT_ACCEPT),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static(DEFAULT_ACCEPT_LANGUAGE),
        );

        let client = Client::builder()
            .cookie_store(true)
            .default_headers(headers)
            .build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client as-is.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageHttpClient for ReqwestPageClient {
    async fn get(&self, url: &Url, timeout: Duration) -> Result<HttpResponse, TransportError> {
        let started = Instant::now();
        let response = self
            .client
            .get(url.as_str())
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| classify_reqwest(err, started.elapsed(), timeout))?;

        let status = response.status().as_u16();
        let headers = convert_headers(response.headers());
        let final_url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| classify_reqwest(err, started.elapsed(), timeout))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
            url: final_url,
            elapsed: started.elapsed(),
        })
    }
}

fn classify_reqwest(err: reqwest::Error, elapsed: Duration, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_connect() {
        TransportError::Connect {
            elapsed,
            message: err.to_string(),
        }
    } else {
        TransportError::Other(err.to_string())
    }
}

fn convert_headers(map: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in map.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }
    headers
}
