//! Individual scoring stages, evaluated in declaration order.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use url::Url;

use super::{BlockCategory, PageKind};
use crate::core::parser::has_result_markup;

/// Pre-normalised view shared by all stages of one detection run.
pub(crate) struct Scan<'a> {
    pub body: &'a str,
    pub lower: &'a str,
    /// Visible text outside result entries, query echo removed.
    pub prose: &'a str,
    pub url: &'a Url,
    pub kind: PageKind,
    pub min_length: usize,
}

pub(crate) struct Signal {
    pub delta: u8,
    pub category: Option<BlockCategory>,
    pub indicator: String,
}

impl Signal {
    fn new(delta: u8, category: Option<BlockCategory>, indicator: impl Into<String>) -> Self {
        Self {
            delta,
            category,
            indicator: indicator.into(),
        }
    }
}

pub(crate) type StageFn = fn(&Scan<'_>) -> Option<Signal>;

pub(crate) const STAGES: &[(&str, StageFn)] = &[
    ("url_pattern", url_pattern),
    ("keyword", keyword),
    ("backend_phrase", backend_phrase),
    ("visual_challenge", visual_challenge),
    ("anti_automation", anti_automation),
    ("structural", structural),
];

const URL_FRAGMENTS: &[(&str, BlockCategory)] = &[
    ("/sorry/", BlockCategory::Captcha),
    ("captcha", BlockCategory::Captcha),
    ("/challenge", BlockCategory::Captcha),
    ("/cdn-cgi/challenge-platform", BlockCategory::Captcha),
    ("anomaly", BlockCategory::RateLimited),
    ("/blocked", BlockCategory::RateLimited),
    ("unusual-traffic", BlockCategory::RateLimited),
];

const KEYWORDS: &[(&str, Option<BlockCategory>)] = &[
    ("unusual traffic", Some(BlockCategory::RateLimited)),
    ("automated queries", Some(BlockCategory::RateLimited)),
    ("are you a robot", Some(BlockCategory::Captcha)),
    ("captcha", Some(BlockCategory::Captcha)),
    ("access denied", None),
    ("bot detected", None),
];

const BACKEND_PHRASES: &[(&str, u8, BlockCategory)] = &[
    ("please enable javascript", 30, BlockCategory::JavascriptRequired),
    ("javascript is required", 30, BlockCategory::JavascriptRequired),
    ("javascript is disabled", 30, BlockCategory::JavascriptRequired),
    ("you have been rate limited", 35, BlockCategory::RateLimited),
    ("rate limit exceeded", 35, BlockCategory::RateLimited),
    ("too many requests", 35, BlockCategory::RateLimited),
    ("bots use duckduckgo too", 35, BlockCategory::RateLimited),
    ("temporarily blocked", 35, BlockCategory::RateLimited),
    ("not available in your region", 30, BlockCategory::RegionBlocked),
    ("not available in your country", 30, BlockCategory::RegionBlocked),
];

const WIDGET_MARKERS: &[&str] = &[
    "g-recaptcha",
    "h-captcha",
    "cf-turnstile",
    "data-sitekey",
    "captcha-container",
    "challenge-form",
];

const AUTOMATION_MARKERS: &[&str] = &[
    "navigator.webdriver",
    "headlesschrome",
    "__selenium",
    "phantomjs",
    "automation detected",
];

const HUMAN_VERIFICATION: &[&str] = &[
    "verify you are human",
    "verify that you are human",
    "confirm you are not a robot",
    "human verification",
];

const MAX_SCRIPTS: usize = 25;
const STRUCTURAL_CAP: u8 = 20;

static CHALLENGE_IFRAME: Lazy<Regex> = Lazy::new(|| {
    build_regex(r#"<iframe[^>]+src\s*=\s*["'][^"']*(recaptcha|hcaptcha|challenges\.cloudflare\.com|captcha)"#)
});
static META_REFRESH: Lazy<Regex> = Lazy::new(|| {
    build_regex(r#"<meta[^>]+http-equiv\s*=\s*["']?refresh["']?[^>]*content\s*=\s*["']([^"']*)["']"#)
});
static SCRIPT_TAG: Lazy<Regex> = Lazy::new(|| build_regex(r"<script\b"));
static RESULT_REGION: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("div.result, div.web-result, a.result-link, td.result-snippet, .result__snippet")
        .unwrap_or_else(|err| panic!("invalid result region selector: {err:?}"))
});

/// Lowercased text of `body` minus result entries and the `q` the page was
/// requested with, whitespace collapsed. Phrase stages read this so a
/// results page about "too many requests" does not score as a rate limit.
pub(crate) fn prose(body: &str, url: &Url) -> String {
    let document = Html::parse_document(body);
    let mut raw = String::with_capacity(body.len() / 2);
    for node in document.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let in_result = node
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|element| RESULT_REGION.matches(&element));
        if !in_result {
            raw.push_str(text);
            raw.push(' ');
        }
    }

    let mut prose = collapse_whitespace(&raw.to_ascii_lowercase());
    if let Some(query) = url
        .query_pairs()
        .find(|(key, _)| key == "q")
        .map(|(_, value)| collapse_whitespace(&value.to_ascii_lowercase()))
        && !query.is_empty()
    {
        prose = prose.replace(&query, " ");
    }
    prose
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn url_pattern(scan: &Scan<'_>) -> Option<Signal> {
    let path = scan.url.path().to_ascii_lowercase();
    URL_FRAGMENTS
        .iter()
        .find(|(fragment, _)| path.contains(fragment))
        .map(|(fragment, category)| Signal::new(40, Some(*category), *fragment))
}

fn keyword(scan: &Scan<'_>) -> Option<Signal> {
    KEYWORDS
        .iter()
        .find(|(phrase, _)| scan.prose.contains(phrase))
        .map(|(phrase, category)| Signal::new(25, *category, *phrase))
}

fn backend_phrase(scan: &Scan<'_>) -> Option<Signal> {
    if let Some((phrase, delta, category)) = BACKEND_PHRASES
        .iter()
        .find(|(phrase, _, _)| scan.prose.contains(phrase))
    {
        return Some(Signal::new(*delta, Some(*category), *phrase));
    }

    let length = scan.body.trim().len();
    (length < scan.min_length).then(|| {
        Signal::new(
            20,
            Some(BlockCategory::StructuralAnomaly),
            format!("short page ({length} bytes)"),
        )
    })
}

fn visual_challenge(scan: &Scan<'_>) -> Option<Signal> {
    if let Some(found) = CHALLENGE_IFRAME.captures(scan.body).and_then(|c| c.get(1)) {
        return Some(Signal::new(
            40,
            Some(BlockCategory::Captcha),
            format!("challenge iframe ({})", found.as_str()),
        ));
    }

    WIDGET_MARKERS
        .iter()
        .find(|marker| scan.lower.contains(*marker))
        .map(|marker| Signal::new(30, Some(BlockCategory::Captcha), *marker))
}

fn anti_automation(scan: &Scan<'_>) -> Option<Signal> {
    let mut strongest: Option<Signal> = None;
    let mut consider = |signal: Signal| {
        if strongest.as_ref().is_none_or(|current| signal.delta > current.delta) {
            strongest = Some(signal);
        }
    };

    if let Some(marker) = AUTOMATION_MARKERS.iter().find(|m| scan.lower.contains(*m)) {
        consider(Signal::new(15, None, *marker));
    }
    if let Some(phrase) = HUMAN_VERIFICATION.iter().find(|p| scan.prose.contains(*p)) {
        consider(Signal::new(25, Some(BlockCategory::Captcha), *phrase));
    }
    if scan.lower.contains("canvas fingerprint")
        || (scan.lower.contains("todataurl(") && scan.lower.contains("getcontext("))
    {
        consider(Signal::new(10, None, "canvas fingerprinting"));
    }

    strongest
}

fn structural(scan: &Scan<'_>) -> Option<Signal> {
    let mut delta: u8 = 0;
    let mut indicators = Vec::new();

    if let Some(target) = META_REFRESH.captures(scan.body).and_then(|c| c.get(1)) {
        delta += 15;
        let decoded = html_escape::decode_html_entities(target.as_str());
        indicators.push(format!("meta refresh ({})", decoded.trim()));
    }

    if scan.kind == PageKind::SearchResults && !has_result_markup(scan.body) {
        delta += 10;
        indicators.push("missing result markup".to_string());
    }

    let scripts = SCRIPT_TAG.find_iter(scan.body).count();
    if scripts > MAX_SCRIPTS {
        delta += 10;
        indicators.push(format!("{scripts} script tags"));
    }

    (delta > 0).then(|| {
        Signal::new(
            delta.min(STRUCTURAL_CAP),
            Some(BlockCategory::StructuralAnomaly),
            indicators.join("; "),
        )
    })
}

fn build_regex(pattern: &str) -> Regex {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid detection regex `{pattern}`: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan<'a>(body: &'a str, lower: &'a str, url: &'a Url, kind: PageKind) -> Scan<'a> {
        Scan {
            body,
            lower,
            prose: lower,
            url,
            kind,
            min_length: 0,
        }
    }

    #[test]
    fn structural_stage_is_capped() {
        let mut body = String::from(r#"<meta http-equiv="refresh" content="0;url=/next?a=1&amp;b=2">"#);
        for _ in 0..30 {
            body.push_str("<script>1</script>");
        }
        let lower = body.to_ascii_lowercase();
        let url = Url::parse("https://example.com/").unwrap();
        let signal = structural(&scan(&body, &lower, &url, PageKind::SearchResults)).unwrap();
        assert_eq!(signal.delta, STRUCTURAL_CAP);
        assert!(signal.indicator.contains("a=1&b=2"));
    }

    #[test]
    fn anti_automation_keeps_strongest_signal() {
        let body = "navigator.webdriver check; please verify you are human";
        let lower = body.to_ascii_lowercase();
        let url = Url::parse("https://example.com/").unwrap();
        let signal = anti_automation(&scan(body, &lower, &url, PageKind::Generic)).unwrap();
        assert_eq!(signal.delta, 25);
        assert_eq!(signal.category, Some(BlockCategory::Captcha));
    }

    #[test]
    fn prose_skips_result_entries_and_the_echoed_query() {
        let body = r#"<html><head><title>too many requests at DuckDuckGo</title></head><body>
            <div class="result"><a class="result__a" href="https://a.example/">HTTP 429 Too Many Requests</a>
            <a class="result__snippet">The server answers Too Many Requests when you hit a captcha wall.</a></div>
            <p>Some   footer
            text</p></body></html>"#;
        let url = Url::parse("https://html.duckduckgo.com/html/?q=Too+Many+Requests").unwrap();
        let text = prose(body, &url);
        assert!(!text.contains("too many requests"), "{text}");
        assert!(!text.contains("captcha"));
        assert!(text.contains("some footer text"));
    }

    #[test]
    fn prose_keeps_block_page_wording() {
        let body = "<html><body><h1>Too Many Requests</h1><p>Please slow down.</p></body></html>";
        let url = Url::parse("https://example.com/").unwrap();
        assert!(prose(body, &url).contains("too many requests please slow down."));
    }

    #[test]
    fn url_stage_ignores_query_text() {
        let body = "";
        let url = Url::parse("https://html.duckduckgo.com/html/?q=captcha+solver").unwrap();
        assert!(url_pattern(&scan(body, body, &url, PageKind::SearchResults)).is_none());
    }
}
