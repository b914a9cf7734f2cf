//! HTML page reduction: hash and SimHash dedup, family quota, pagination
//! diff, atomic save, link discovery.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use tracing::debug;

use strider_common::{sha256_hex, Artifact, ArtifactKind, CodexEntry, EndpointRecord};

use crate::canonical::CanonicalUrl;
use crate::dedup::pagination_sibling_key;
use crate::family::{FamilyVerdict, SampleStats};
use crate::fetcher::FetchResponse;
use crate::scheduler::WorkItem;
use crate::simhash;

use super::{html_title, page_text, Discovered, ProcessError, ProcessOutcome, Verdict};

/// Navigation and resource references. `href` covers `<a>` and `<link>`,
/// `src` covers `<script>` and `<img>`, `action` covers `<form>`.
static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href\s*=\s*["']([^"']+)["']"#).expect("valid regex"));
static SRC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"src\s*=\s*["']([^"']+)["']"#).expect("valid regex"));
static ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"action\s*=\s*["']([^"']+)["']"#).expect("valid regex"));
static META_REFRESH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)http-equiv\s*=\s*["']refresh["'][^>]*?content\s*=\s*["'][^"']*?url\s*=\s*([^"'\s]+)["']"#)
        .expect("valid regex")
});

/// Path markers that make a discovered link worth recording as an endpoint.
const ENDPOINT_MARKERS: &[&str] = &["/api", "/graphql", "/v1", "/v2"];

pub fn process(
    item: &WorkItem,
    url: &CanonicalUrl,
    response: &FetchResponse,
    deps: &mut super::ProcessorDeps<'_>,
) -> Result<ProcessOutcome, ProcessError> {
    let raw_body = String::from_utf8_lossy(&response.body);
    let html: &str = response.rendered_html.as_deref().unwrap_or(&raw_body);

    let sha256 = sha256_hex(html.as_bytes());
    if deps.dedup.seen_content(&sha256) {
        debug!(url = %url.canonical, "duplicate html body");
        return Ok(ProcessOutcome::skipped(Verdict::Duplicate));
    }

    let text = page_text(html, Some(&url.canonical));
    let shingle_size = deps.heuristics.simhash_shingle_size;
    let fingerprint = simhash::simhash(&text, shingle_size);
    if let Some((similarity, other)) = deps.dedup.near_duplicate_html(fingerprint) {
        debug!(url = %url.canonical, similarity, near = other, "near-duplicate html");
        return Ok(ProcessOutcome::skipped(Verdict::Duplicate));
    }

    // A later page of an already-saved listing must differ enough to keep.
    let shingles = simhash::shingle_hashes(&text, shingle_size);
    let sibling = pagination_sibling_key(url);
    if let Some(ref sibling_key) = sibling {
        if let Some(baseline) = deps.dedup.pagination_baseline(sibling_key) {
            let diff = 1.0 - simhash::jaccard(baseline, &shingles);
            if diff <= deps.heuristics.pagination_diff_min {
                debug!(url = %url.canonical, diff, "pagination sibling unchanged");
                return Ok(ProcessOutcome::skipped(Verdict::PaginationSkipped));
            }
        }
    }

    let title = html_title(html);
    let stats = SampleStats {
        title_len: title.as_deref().map(str::len).unwrap_or(0),
        body_len: text.len(),
        status: response.status,
    };
    let family_key = deps.families.key_for(url);
    if deps.families.admit(&family_key, &stats) == FamilyVerdict::Saturated {
        deps.families.commit_skip(&family_key);
        return Ok(ProcessOutcome::skipped(Verdict::FamilySkipped));
    }

    let path = deps.storage.path_for(ArtifactKind::Html, url);
    let size = deps.storage.write_atomic(&path, html.as_bytes())?;

    // The write landed; now the registries may learn about it.
    deps.dedup.mark_content(&sha256);
    deps.dedup.register_html_fingerprint(fingerprint, &url.canonical);
    if let Some(sibling_key) = sibling {
        deps.dedup.record_pagination_save(&sibling_key, shingles);
    }
    deps.families.commit_save(&family_key, stats);

    let discovered = extract_links(html);
    let endpoints = discovered
        .iter()
        .filter(|d| {
            let lower = d.url.to_lowercase();
            ENDPOINT_MARKERS.iter().any(|m| lower.contains(m))
        })
        .map(|d| EndpointRecord {
            url: d.url.clone(),
            source: "html".to_string(),
            score: item.score,
        })
        .collect();

    let artifact = Artifact {
        kind: ArtifactKind::Html,
        url: url.canonical.clone(),
        path: path.clone(),
        sha256: sha256.clone(),
        size,
        status: response.status,
        depth: item.meta.depth,
        captured_at: Utc::now(),
        redacted: false,
        signal: None,
    };
    let codex = CodexEntry {
        path,
        kind: ArtifactKind::Html,
        sha256,
        url: url.canonical.clone(),
        priority: item.score,
        hints: title.map(|t| vec![format!("title:{t}")]).unwrap_or_default(),
    };

    let mut outcome = ProcessOutcome::saved(artifact, codex);
    outcome.discovered = discovered;
    outcome.endpoints = endpoints;
    Ok(outcome)
}

/// All discovered references, deduplicated in document order. Relative
/// values stay raw; the scheduler resolves them against the source URL.
fn extract_links(html: &str) -> Vec<Discovered> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    let mut push = |raw: &str| {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || trimmed.starts_with('#')
            || trimmed.starts_with("javascript:")
            || trimmed.starts_with("mailto:")
            || trimmed.starts_with("tel:")
            || trimmed.starts_with("data:")
        {
            return;
        }
        if seen.insert(trimmed.to_string()) {
            links.push(Discovered {
                url: trimmed.to_string(),
                reason: "html-discovery",
            });
        }
    };

    for re in [&*HREF_RE, &*SRC_RE, &*ACTION_RE, &*META_REFRESH_RE] {
        for cap in re.captures_iter(html) {
            push(&cap[1]);
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(html: &str) -> Vec<String> {
        extract_links(html).into_iter().map(|d| d.url).collect()
    }

    #[test]
    fn extracts_all_reference_kinds() {
        let html = r#"
            <a href="/about">About</a>
            <link href="/styles.css" rel="stylesheet">
            <script src="/static/app.js"></script>
            <img src="/logo.png">
            <form action="/search" method="get"></form>
            <meta http-equiv="refresh" content="3;url=/next-page">
        "#;
        let found = urls(html);
        assert!(found.contains(&"/about".to_string()));
        assert!(found.contains(&"/styles.css".to_string()));
        assert!(found.contains(&"/static/app.js".to_string()));
        assert!(found.contains(&"/logo.png".to_string()));
        assert!(found.contains(&"/search".to_string()));
        assert!(found.contains(&"/next-page".to_string()));
    }

    #[test]
    fn skips_non_navigable_schemes_and_fragments() {
        let html = r##"
            <a href="#top">top</a>
            <a href="javascript:void(0)">noop</a>
            <a href="mailto:x@a.test">mail</a>
            <a href="data:text/plain,hi">inline</a>
            <a href="/real">real</a>
        "##;
        assert_eq!(urls(html), vec!["/real".to_string()]);
    }

    #[test]
    fn deduplicates_in_document_order() {
        let html = r#"
            <a href="/a">one</a>
            <a href="/b">two</a>
            <a href="/a">again</a>
        "#;
        assert_eq!(urls(html), vec!["/a".to_string(), "/b".to_string()]);
    }

    #[test]
    fn single_quoted_attributes_work() {
        let html = "<a href='/single'>x</a><script src='/s.js'></script>";
        let found = urls(html);
        assert!(found.contains(&"/single".to_string()));
        assert!(found.contains(&"/s.js".to_string()));
    }
}
