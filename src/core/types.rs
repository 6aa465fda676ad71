//! Data structures shared by the detection engine, the transport layer and the
//! orchestration façade.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::detection::DetectionResult;

/// Single organic result extracted from a search backend page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub position: usize,
}

/// Safe-search level forwarded to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafeSearch {
    Strict,
    #[default]
    Moderate,
    Off,
}

impl SafeSearch {
    pub(crate) fn query_value(self) -> &'static str {
        match self {
            SafeSearch::Strict => "1",
            SafeSearch::Moderate => "-1",
            SafeSearch::Off => "-2",
        }
    }
}

/// Recency filter forwarded to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeRange {
    Day,
    Week,
    Month,
    Year,
}

impl TimeRange {
    pub(crate) fn query_value(self) -> &'static str {
        match self {
            TimeRange::Day => "d",
            TimeRange::Week => "w",
            TimeRange::Month => "m",
            TimeRange::Year => "y",
        }
    }
}

/// Per-call search parameters. Input validation happens upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub count: usize,
    pub language: Option<String>,
    pub safe_search: SafeSearch,
    pub time_range: Option<TimeRange>,
    /// Overrides the adaptive timeout for the first attempt when set.
    #[serde(with = "optional_millis")]
    pub timeout: Option<Duration>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            count: 10,
            language: None,
            safe_search: SafeSearch::default(),
            time_range: None,
            timeout: None,
        }
    }
}

impl SearchOptions {
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count.max(1);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_safe_search(mut self, level: SafeSearch) -> Self {
        self.safe_search = level;
        self
    }

    pub fn with_time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the backend query URL for `query` against `endpoint`.
    pub fn build_url(&self, endpoint: &Url, query: &str) -> Url {
        let mut url = endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", query);
            if let Some(language) = self.language.as_deref() {
                pairs.append_pair("kl", language);
            }
            pairs.append_pair("kp", self.safe_search.query_value());
            if let Some(range) = self.time_range {
                pairs.append_pair("df", range.query_value());
            }
        }
        url
    }
}

/// Options for a batch of independent searches.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Queries of this batch allowed in flight at once. The orchestrator's
    /// own concurrency bound still applies.
    pub max_concurrency: Option<usize>,
    /// Pacing inserted before each query after the first one.
    pub query_delay: Option<Duration>,
    pub fail_fast: bool,
    /// Wall-clock cap for each individual query.
    pub timeout: Option<Duration>,
    pub search: SearchOptions,
}

/// Outcome of one query inside a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub index: usize,
    pub query: String,
    pub success: bool,
    pub results: Vec<SearchResult>,
    pub error: Option<String>,
    #[serde(with = "millis")]
    pub duration: Duration,
}

/// Rendering path requested by the caller of `fetch_page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Plain HTTP only; blocks surface as errors.
    Plain,
    /// Always go through the automation engine.
    Browser,
    /// Plain HTTP first, automation engine when blocked.
    #[default]
    Auto,
}

/// Output representation hint forwarded untouched to the content processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Markdown,
    Text,
    Html,
    Json,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Markdown => "markdown",
            OutputFormat::Text => "text",
            OutputFormat::Html => "html",
            OutputFormat::Json => "json",
        }
    }
}

/// Options for a single page fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    pub render: RenderMode,
    #[serde(with = "optional_millis")]
    pub timeout: Option<Duration>,
    pub max_length: Option<usize>,
    pub readability: bool,
    pub format: OutputFormat,
    pub context_id: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            render: RenderMode::Auto,
            timeout: None,
            max_length: None,
            readability: true,
            format: OutputFormat::default(),
            context_id: None,
        }
    }
}

/// Which path produced the returned HTML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderedBy {
    Http,
    Browser,
}

/// Raw fetch result handed to the content processor.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub url: Url,
    pub final_url: Url,
    pub status: u16,
    pub html: String,
    pub title: Option<String>,
    pub rendered_by: RenderedBy,
    pub detection: DetectionResult,
    pub attempts: u32,
    pub duration: Duration,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                serializer.serialize_some(&(duration.as_millis().min(u64::MAX as u128) as u64))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
