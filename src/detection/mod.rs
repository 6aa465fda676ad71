//! Bot/block detection engine.
//!
//! Scores a response body and its resolved URL through an ordered battery of
//! independent stages. Every stage is a plain function over an immutable
//! [`DetectionInput`]; the detector itself holds only thresholds, so it can be
//! shared freely and called inline on the hot path.

mod stages;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::error::OrchestratorError;

use stages::{STAGES, Scan};

/// Responses scoring at or above this are treated as blocked.
pub const BLOCK_THRESHOLD: u8 = 30;

/// Inferred reason a response was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCategory {
    RateLimited,
    Captcha,
    RegionBlocked,
    JavascriptRequired,
    StructuralAnomaly,
}

/// What the caller expected to receive. Search result pages get the stricter
/// structural checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageKind {
    SearchResults,
    #[default]
    Generic,
}

/// Immutable input handed to each stage.
#[derive(Debug, Clone, Copy)]
pub struct DetectionInput<'a> {
    pub body: &'a str,
    pub url: &'a Url,
    pub kind: PageKind,
}

impl<'a> DetectionInput<'a> {
    pub fn new(body: &'a str, url: &'a Url, kind: PageKind) -> Self {
        Self { body, url, kind }
    }
}

/// Contribution of a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageHit {
    pub stage: &'static str,
    pub delta: u8,
    pub category: Option<BlockCategory>,
    pub indicator: String,
}

/// Verdict for one response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectionResult {
    pub confidence: u8,
    pub category: Option<BlockCategory>,
    pub stages: Vec<StageHit>,
    pub is_blocked: bool,
}

impl DetectionResult {
    /// Names of the stages that fired, in evaluation order.
    pub fn triggered(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.stages.iter().map(|hit| hit.stage)
    }

    /// Map a blocked verdict onto the error taxonomy.
    pub fn to_error(&self, url: &str) -> OrchestratorError {
        match self.category {
            Some(BlockCategory::Captcha) => OrchestratorError::CaptchaDetected {
                url: url.to_string(),
                confidence: self.confidence,
            },
            Some(BlockCategory::RateLimited) => OrchestratorError::RateLimited {
                endpoint: url.to_string(),
                retry_after: None,
            },
            other => OrchestratorError::Blocked {
                url: url.to_string(),
                reason: match other {
                    Some(category) => format!(
                        "{:?} (confidence {}, stages: {})",
                        category,
                        self.confidence,
                        self.triggered().collect::<Vec<_>>().join(",")
                    ),
                    None => format!("confidence {}", self.confidence),
                },
            },
        }
    }
}

/// Detector tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub threshold: u8,
    /// Search result pages shorter than this are suspiciously short.
    pub min_search_length: usize,
    pub min_generic_length: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: BLOCK_THRESHOLD,
            min_search_length: 1000,
            min_generic_length: 150,
        }
    }
}

/// Stateless multi-stage scorer.
#[derive(Debug, Clone)]
pub struct BlockDetector {
    threshold: u8,
    min_search_length: usize,
    min_generic_length: usize,
}

impl Default for BlockDetector {
    fn default() -> Self {
        Self::from_config(&DetectionConfig::default())
    }
}

impl BlockDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &DetectionConfig) -> Self {
        Self {
            threshold: config.threshold,
            min_search_length: config.min_search_length,
            min_generic_length: config.min_generic_length,
        }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Run every stage in order and fold their contributions.
    ///
    /// The first stage that reports a category decides the category of the
    /// whole verdict, even when a later stage contributes more confidence.
    pub fn detect(&self, input: &DetectionInput<'_>) -> DetectionResult {
        let lower = input.body.to_ascii_lowercase();
        let prose = stages::prose(input.body, input.url);
        let scan = Scan {
            body: input.body,
            lower: &lower,
            prose: &prose,
            url: input.url,
            kind: input.kind,
            min_length: match input.kind {
                PageKind::SearchResults => self.min_search_length,
                PageKind::Generic => self.min_generic_length,
            },
        };

        let mut total: u32 = 0;
        let mut category = None;
        let mut hits = Vec::new();

        for &(name, stage) in STAGES {
            let Some(signal) = stage(&scan) else {
                continue;
            };
            total += u32::from(signal.delta);
            if category.is_none() {
                category = signal.category;
            }
            hits.push(StageHit {
                stage: name,
                delta: signal.delta,
                category: signal.category,
                indicator: signal.indicator,
            });
        }

        let confidence = total.min(100) as u8;
        DetectionResult {
            confidence,
            category,
            stages: hits,
            is_blocked: confidence >= self.threshold,
        }
    }

    /// Convenience wrapper over [`detect`](Self::detect).
    pub fn detect_body(&self, body: &str, url: &Url, kind: PageKind) -> DetectionResult {
        self.detect(&DetectionInput::new(body, url, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    fn clean_results_page() -> String {
        let mut html = String::from("<html><head><title>rust at DuckDuckGo</title></head><body><div class=\"results\">");
        for i in 0..10 {
            html.push_str(&format!(
                "<div class=\"result results_links\"><h2 class=\"result__title\"><a class=\"result__a\" href=\"https://example{i}.com/\">Example result number {i}</a></h2><a class=\"result__snippet\">A perfectly ordinary snippet describing page {i} of the results.</a></div>"
            ));
        }
        html.push_str("</div></body></html>");
        html
    }

    #[test]
    fn captcha_widget_alone_is_blocked() {
        let detector = BlockDetector::new();
        let body = r#"<div class="g-recaptcha" data-sitekey="abc"></div>"#;
        let result = detector.detect_body(body, &url("https://example.com/page"), PageKind::Generic);
        assert!(result.confidence >= 30, "confidence {}", result.confidence);
        assert!(result.is_blocked);
        assert_eq!(result.category, Some(BlockCategory::Captcha));
    }

    #[test]
    fn clean_results_page_passes() {
        let detector = BlockDetector::new();
        let body = clean_results_page();
        let result = detector.detect_body(
            &body,
            &url("https://html.duckduckgo.com/html/?q=rust"),
            PageKind::SearchResults,
        );
        assert!(result.confidence < 30, "confidence {}", result.confidence);
        assert!(!result.is_blocked);
        assert!(result.stages.is_empty());
    }

    #[test]
    fn results_page_for_a_block_phrase_query_passes() {
        let detector = BlockDetector::new();
        let mut body = String::from(
            "<html><head><title>too many requests at DuckDuckGo</title></head><body><div class=\"results\">",
        );
        for i in 0..10 {
            body.push_str(&format!(
                "<div class=\"result results_links\"><h2 class=\"result__title\"><a class=\"result__a\" href=\"https://example{i}.com/\">Handling Too Many Requests, part {i}</a></h2><a class=\"result__snippet\">Why servers say too many requests, unusual traffic and rate limit exceeded.</a></div>"
            ));
        }
        body.push_str("</div></body></html>");
        let result = detector.detect_body(
            &body,
            &url("https://html.duckduckgo.com/html/?q=too+many+requests"),
            PageKind::SearchResults,
        );
        assert!(!result.is_blocked, "{result:?}");
        assert!(result.stages.is_empty(), "{result:?}");
    }

    #[test]
    fn first_category_wins_over_later_stronger_stage() {
        // URL stage fires first with rate limiting; the iframe challenge later
        // contributes as much or more but does not override the category.
        let detector = BlockDetector::new();
        let body = format!(
            "{}<iframe src=\"https://www.google.com/recaptcha/api2/anchor\"></iframe>",
            "x".repeat(2000)
        );
        let result = detector.detect_body(
            &body,
            &url("https://duckduckgo.com/blocked?reason=anomaly"),
            PageKind::Generic,
        );
        assert_eq!(result.category, Some(BlockCategory::RateLimited));
        assert!(result.triggered().any(|stage| stage == "visual_challenge"));
        assert!(result.is_blocked);
    }

    #[test]
    fn confidence_is_clamped() {
        let detector = BlockDetector::new();
        let body = r#"<meta http-equiv="refresh" content="0;url=/sorry/">
            Please enable JavaScript. Unusual traffic from your network.
            Verify you are human. <iframe src="/recaptcha/api2/anchor"></iframe>
            <div class="h-captcha"></div> navigator.webdriver"#;
        let result = detector.detect_body(
            body,
            &url("https://example.com/sorry/index"),
            PageKind::SearchResults,
        );
        assert_eq!(result.confidence, 100);
        assert_eq!(result.category, Some(BlockCategory::Captcha));
    }

    #[test]
    fn short_generic_page_is_not_blocked_alone() {
        let detector = BlockDetector::new();
        let result = detector.detect_body("<p>ok</p>", &url("https://example.com/"), PageKind::Generic);
        assert_eq!(result.confidence, 20);
        assert_eq!(result.category, Some(BlockCategory::StructuralAnomaly));
        assert!(!result.is_blocked);
    }

    #[test]
    fn configured_threshold_and_lengths_apply() {
        let detector = BlockDetector::from_config(&DetectionConfig {
            threshold: 15,
            min_search_length: 1000,
            min_generic_length: 5,
        });
        assert_eq!(detector.threshold(), 15);

        let short = detector.detect_body("<p>ok</p>", &url("https://example.com/"), PageKind::Generic);
        assert!(short.stages.is_empty());

        let strict = BlockDetector::from_config(&DetectionConfig {
            threshold: 15,
            ..DetectionConfig::default()
        });
        let result = strict.detect_body("<p>ok</p>", &url("https://example.com/"), PageKind::Generic);
        assert_eq!(result.confidence, 20);
        assert!(result.is_blocked);
    }

    #[test]
    fn maps_categories_to_errors() {
        let detector = BlockDetector::new();
        let result = detector.detect_body(
            r#"<div class="cf-turnstile">Solve the captcha to continue</div>"#,
            &url("https://example.com/"),
            PageKind::Generic,
        );
        assert!(matches!(
            result.to_error("https://example.com/"),
            OrchestratorError::CaptchaDetected { .. }
        ));
    }
}
