//! Result page parsing for the search backend.
//!
//! Understands both the classic HTML front-end (`div.result`) and the lite
//! front-end (table rows with `a.result-link`). Redirect links of the form
//! `/l/?uddg=<encoded>` are unwrapped to the target URL.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

use super::types::SearchResult;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("page contains no recognisable result markup")]
    NoResultMarkup,
}

fn selector(raw: &str) -> Selector {
    Selector::parse(raw).unwrap_or_else(|err| panic!("invalid result selector `{raw}`: {err:?}"))
}

static CLASSIC_RESULT: Lazy<Selector> = Lazy::new(|| selector("div.result, div.web-result"));
static CLASSIC_TITLE: Lazy<Selector> = Lazy::new(|| selector("a.result__a, h2 a"));
static CLASSIC_SNIPPET: Lazy<Selector> = Lazy::new(|| selector(".result__snippet"));
static LITE_LINK: Lazy<Selector> = Lazy::new(|| selector("a.result-link"));
static LITE_SNIPPET: Lazy<Selector> = Lazy::new(|| selector("td.result-snippet"));
static NO_RESULTS: Lazy<Selector> = Lazy::new(|| selector(".no-results, div.no-results"));
static TITLE: Lazy<Selector> = Lazy::new(|| selector("title"));

const NO_RESULTS_PHRASES: &[&str] = &["no results found for", "no results."];

/// Whether the page carries markup that a results page is expected to have.
/// Pages explicitly stating that nothing matched count as having it.
pub fn has_result_markup(html: &str) -> bool {
    let lower = html.to_ascii_lowercase();
    lower.contains("result__a")
        || lower.contains("result-link")
        || lower.contains("web-result")
        || is_no_results_text(&lower)
}

fn is_no_results_text(lower: &str) -> bool {
    lower.contains("no-results") || NO_RESULTS_PHRASES.iter().any(|p| lower.contains(p))
}

/// Extract up to `limit` results from a backend page.
///
/// Returns an empty list for explicit "no results" pages and
/// [`ParseError::NoResultMarkup`] when the page is not a results page at all.
pub fn parse_results(html: &str, base: &Url, limit: usize) -> Result<Vec<SearchResult>, ParseError> {
    let document = Html::parse_document(html);
    let mut results = Vec::new();
    let mut seen = HashSet::new();

    for element in document.select(&CLASSIC_RESULT) {
        if results.len() >= limit {
            break;
        }
        let Some(link) = element.select(&CLASSIC_TITLE).next() else {
            continue;
        };
        let snippet = element
            .select(&CLASSIC_SNIPPET)
            .next()
            .map(collapse_text)
            .unwrap_or_default();
        push_result(&mut results, &mut seen, link, snippet, base);
    }

    if results.is_empty() {
        let snippets: Vec<String> = document.select(&LITE_SNIPPET).map(collapse_text).collect();
        for (index, link) in document.select(&LITE_LINK).enumerate() {
            if results.len() >= limit {
                break;
            }
            let snippet = snippets.get(index).cloned().unwrap_or_default();
            push_result(&mut results, &mut seen, link, snippet, base);
        }
    }

    if results.is_empty() {
        let explicit_empty = document.select(&NO_RESULTS).next().is_some()
            || is_no_results_text(&html.to_ascii_lowercase());
        if !explicit_empty {
            return Err(ParseError::NoResultMarkup);
        }
    }

    Ok(results)
}

fn push_result(
    results: &mut Vec<SearchResult>,
    seen: &mut HashSet<String>,
    link: ElementRef<'_>,
    snippet: String,
    base: &Url,
) {
    let Some(href) = link.value().attr("href") else {
        return;
    };
    let Some(url) = resolve_href(href, base) else {
        return;
    };
    let title = collapse_text(link);
    if title.is_empty() || !seen.insert(url.clone()) {
        return;
    }
    results.push(SearchResult {
        title,
        url,
        snippet,
        position: results.len() + 1,
    });
}

/// Text of the document's `<title>`, whitespace collapsed.
pub fn page_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    document
        .select(&TITLE)
        .next()
        .map(collapse_text)
        .filter(|title| !title.is_empty())
}

/// Resolve a result href, unwrapping backend redirect links.
pub fn resolve_href(href: &str, base: &Url) -> Option<String> {
    let href = html_escape::decode_html_entities(href.trim());
    let resolved = base.join(&href).ok()?;

    if resolved.path().starts_with("/l/")
        && let Some((_, target)) = resolved.query_pairs().find(|(key, _)| key == "uddg")
    {
        return Url::parse(&target).ok().map(String::from);
    }

    match resolved.scheme() {
        "http" | "https" => Some(resolved.into()),
        _ => None,
    }
}

fn collapse_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
