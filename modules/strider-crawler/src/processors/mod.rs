//! Content processors. Each consumes one fetch response plus the context
//! slices it needs, and returns a plain result record the orchestrator
//! applies; processors never reach back into the scheduler.

pub mod api;
pub mod html;
pub mod js;

use spider_transformations::transformation::content::{
    transform_content_input, ReturnFormat, TransformConfig, TransformInput,
};

use strider_common::config::HeuristicsConfig;
use strider_common::{Artifact, CodexEntry, EndpointRecord, StriderError};

use crate::dedup::DedupIndex;
use crate::family::FamilyRegistry;
use crate::storage::Storage;

/// Mutable slices of the crawl context a processor may touch.
pub struct ProcessorDeps<'a> {
    pub dedup: &'a mut DedupIndex,
    pub families: &'a mut FamilyRegistry,
    pub storage: &'a mut Storage,
    pub heuristics: &'a HeuristicsConfig,
}

/// A URL surfaced during processing, not yet canonicalized; the scheduler
/// resolves it against the source page at enqueue time.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub url: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Saved,
    Duplicate,
    FamilySkipped,
    PaginationSkipped,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Saved => "saved",
            Verdict::Duplicate => "duplicate",
            Verdict::FamilySkipped => "family-skipped",
            Verdict::PaginationSkipped => "pagination-skipped",
        }
    }
}

#[derive(Debug)]
pub struct ProcessOutcome {
    pub verdict: Verdict,
    pub artifact: Option<Artifact>,
    pub codex: Option<CodexEntry>,
    pub discovered: Vec<Discovered>,
    pub endpoints: Vec<EndpointRecord>,
}

impl ProcessOutcome {
    pub fn saved(artifact: Artifact, codex: CodexEntry) -> Self {
        Self {
            verdict: Verdict::Saved,
            artifact: Some(artifact),
            codex: Some(codex),
            discovered: Vec::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn skipped(verdict: Verdict) -> Self {
        Self {
            verdict,
            artifact: None,
            codex: None,
            discovered: Vec::new(),
            endpoints: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("parse failure: {0}")]
    Parse(String),

    #[error(transparent)]
    Storage(#[from] StriderError),
}

impl ProcessError {
    /// Tally key for the manifest error table.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessError::Parse(_) => "parse",
            ProcessError::Storage(_) => "io",
        }
    }

    /// Storage collisions mean the deterministic-path invariant broke;
    /// the run must not continue past one.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessError::Storage(StriderError::StorageCollision(_)))
    }
}

/// Readable page text via Readability extraction, used for fingerprinting
/// and the pagination diff. Falls back to a plain tag strip when the
/// extractor finds no main content (sparse or template-only pages).
pub fn page_text(html: &str, url: Option<&str>) -> String {
    let parsed_url = url.and_then(|u| url::Url::parse(u).ok());
    let config = TransformConfig {
        readability: true,
        main_content: true,
        return_format: ReturnFormat::Markdown,
        filter_images: true,
        filter_svg: true,
        clean_html: true,
    };
    let input = TransformInput {
        url: parsed_url.as_ref(),
        content: html.as_bytes(),
        screenshot_bytes: None,
        encoding: None,
        selector_config: None,
        ignore_tags: None,
    };

    let extracted = transform_content_input(input, &config);
    if !extracted.trim().is_empty() {
        return extracted;
    }
    strip_tags(html)
}

fn strip_tags(html: &str) -> String {
    use std::sync::LazyLock;
    static SCRIPT_STYLE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").expect("valid regex")
    });
    static TAG_RE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"<[^>]+>").expect("valid regex"));

    let without_blocks = SCRIPT_STYLE_RE.replace_all(html, " ");
    let without_tags = TAG_RE.replace_all(&without_blocks, " ");
    without_tags
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
}

/// The page's `<title>` text, whitespace-collapsed.
pub fn html_title(html: &str) -> Option<String> {
    use std::sync::LazyLock;
    static TITLE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex")
    });
    TITLE_RE.captures(html).map(|cap| {
        cap[1]
            .split_whitespace()
            .collect::<Vec<&str>>()
            .join(" ")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_tags_drops_markup_and_scripts() {
        let html = r#"<html><head><style>.a{color:red}</style></head>
            <body><h1>Plans</h1><script>var x = "hidden";</script>
            <p>Start free</p></body></html>"#;
        let text = strip_tags(html);
        assert_eq!(text, "Plans Start free");
    }

    #[test]
    fn title_extracted_and_collapsed() {
        let html = "<html><head><title>\n  Store:\n  Items  </title></head></html>";
        assert_eq!(html_title(html).as_deref(), Some("Store: Items"));
        assert!(html_title("<html><body>no title</body></html>").is_none());
    }
}
