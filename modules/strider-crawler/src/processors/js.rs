//! JS bundle capture and endpoint extraction via lightweight source
//! scanning. No parsing: literal-string patterns carry the signal.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use tracing::debug;
use url::Url;

use strider_common::{sha256_hex, Artifact, ArtifactKind, CodexEntry, EndpointRecord};

use crate::canonical::CanonicalUrl;
use crate::fetcher::FetchResponse;
use crate::scheduler::WorkItem;

use super::{Discovered, ProcessError, ProcessOutcome, Verdict};

/// `app.3f9a2b.js`: content-hashed bundle name. One copy per family.
static FINGERPRINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)\.[a-f0-9]{6,}\.js$").expect("valid regex"));

static FETCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"fetch\s*\(\s*['"`]([^'"`]+)['"`]"#).expect("valid regex"));
static AXIOS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"axios\.(?:get|post|put|delete|patch)\s*\(\s*['"`]([^'"`]+)['"`]"#)
        .expect("valid regex")
});
static GRAPHQL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"graphql\s*\(\s*['"`]([^'"`]+)['"`]"#).expect("valid regex"));
static PATH_LITERAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"['"`](/(?:api|graphql|v1|v2)(?:[/?][^'"`\s]*)?)['"`]"#).expect("valid regex")
});
static ABS_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"['"`](https?://[^'"`\s]+)['"`]"#).expect("valid regex"));
static SOURCE_MAP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"//[#@]\s*sourceMappingURL=(\S+)").expect("valid regex"));

pub fn process(
    item: &WorkItem,
    url: &CanonicalUrl,
    response: &FetchResponse,
    deps: &mut super::ProcessorDeps<'_>,
) -> Result<ProcessOutcome, ProcessError> {
    let sha256 = sha256_hex(&response.body);
    if deps.dedup.seen_content(&sha256) {
        debug!(url = %url.canonical, "duplicate js body");
        return Ok(ProcessOutcome::skipped(Verdict::Duplicate));
    }

    // Content-hashed bundles: the same logical script under a new hash is
    // a fresh artifact, but a second URL serving an already-captured
    // fingerprint family is skipped.
    let fingerprint_family = fingerprint_family(url);
    if let Some(ref family) = fingerprint_family {
        if deps.dedup.js_family_seen(family) {
            debug!(url = %url.canonical, family, "fingerprinted bundle already captured");
            return Ok(ProcessOutcome::skipped(Verdict::Duplicate));
        }
    }

    let path = deps.storage.path_for(ArtifactKind::Js, url);
    let size = deps.storage.write_atomic(&path, &response.body)?;

    deps.dedup.mark_content(&sha256);
    if let Some(ref family) = fingerprint_family {
        deps.dedup.mark_js_family(family);
    }

    let body = String::from_utf8_lossy(&response.body);
    let candidates = extract_endpoints(&body);
    let endpoints: Vec<EndpointRecord> = candidates
        .iter()
        .map(|candidate| EndpointRecord {
            url: candidate.clone(),
            source: "js".to_string(),
            score: item.score,
        })
        .collect();

    let mut discovered: Vec<Discovered> = candidates
        .into_iter()
        .map(|candidate| Discovered {
            url: candidate,
            reason: "js-endpoint",
        })
        .collect();
    if let Some(map_url) = same_origin_source_map(&body, &url.canonical) {
        discovered.push(Discovered {
            url: map_url,
            reason: "sourcemap",
        });
    }

    let signal = !endpoints.is_empty();
    let artifact = Artifact {
        kind: ArtifactKind::Js,
        url: url.canonical.clone(),
        path: path.clone(),
        sha256: sha256.clone(),
        size,
        status: response.status,
        depth: item.meta.depth,
        captured_at: Utc::now(),
        redacted: false,
        signal: Some(signal),
    };
    let codex = CodexEntry {
        path,
        kind: ArtifactKind::Js,
        sha256,
        url: url.canonical.clone(),
        priority: item.score,
        hints: if signal {
            vec![format!("endpoints:{}", endpoints.len())]
        } else {
            Vec::new()
        },
    };

    let mut outcome = ProcessOutcome::saved(artifact, codex);
    outcome.discovered = discovered;
    outcome.endpoints = endpoints;
    Ok(outcome)
}

/// host + hashed-bundle stem, when the basename carries a fingerprint.
fn fingerprint_family(url: &CanonicalUrl) -> Option<String> {
    let basename = url.path.rsplit('/').next()?;
    let stem = FINGERPRINT_RE.captures(basename)?.get(1)?.as_str();
    Some(format!("{}/{stem}", url.host))
}

/// Endpoint candidates in document order: call-site literals first, then
/// bare path literals, then absolute URLs.
fn extract_endpoints(body: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for re in [
        &*FETCH_RE,
        &*AXIOS_RE,
        &*GRAPHQL_RE,
        &*PATH_LITERAL_RE,
        &*ABS_URL_RE,
    ] {
        for cap in re.captures_iter(body) {
            let candidate = cap[1].trim().to_string();
            // GraphQL call sites also take query bodies; anything with
            // whitespace is not an address.
            if candidate.is_empty() || candidate.contains(char::is_whitespace) {
                continue;
            }
            if seen.insert(candidate.clone()) {
                out.push(candidate);
            }
        }
    }
    out
}

/// The referenced source map, only when it resolves to the bundle's own
/// origin. Cross-origin maps are ignored rather than fetched.
fn same_origin_source_map(body: &str, bundle_url: &str) -> Option<String> {
    let reference = SOURCE_MAP_RE
        .captures_iter(body)
        .last()
        .map(|cap| cap[1].to_string())?;
    let base = Url::parse(bundle_url).ok()?;
    let resolved = base.join(reference.trim()).ok()?;
    if resolved.scheme() == base.scheme() && resolved.host_str() == base.host_str() {
        Some(resolved.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::Canonicalizer;

    fn url(raw: &str) -> CanonicalUrl {
        Canonicalizer::new(&[], true).canonicalize(raw, None).unwrap()
    }

    #[test]
    fn extracts_call_sites_and_literals() {
        let body = r#"
            fetch('/api/login');
            axios.get("https://api.target.com/v2/users");
            graphql(`query { me }`);
            const fallback = "/v1/feature-flags?team=web";
            const docs = 'https://cdn.target.com/help.js';
        "#;
        let endpoints = extract_endpoints(body);
        assert!(endpoints.contains(&"/api/login".to_string()));
        assert!(endpoints.contains(&"https://api.target.com/v2/users".to_string()));
        assert!(endpoints.contains(&"/v1/feature-flags?team=web".to_string()));
        assert!(endpoints.contains(&"https://cdn.target.com/help.js".to_string()));
        // The graphql query body is not an address.
        assert!(!endpoints.iter().any(|e| e.contains("query")));
    }

    #[test]
    fn candidates_deduplicate() {
        let body = r#"fetch('/api/x'); fetch('/api/x'); const a = "/api/x";"#;
        assert_eq!(extract_endpoints(body), vec!["/api/x".to_string()]);
    }

    #[test]
    fn fingerprinted_basenames_form_families() {
        assert_eq!(
            fingerprint_family(&url("https://a.test/static/app.3f9a2b.js")),
            Some("a.test/app".to_string())
        );
        assert_eq!(
            fingerprint_family(&url("https://a.test/static/app.deadbeef01.js")),
            Some("a.test/app".to_string())
        );
        assert_eq!(fingerprint_family(&url("https://a.test/static/app.js")), None);
        // Too-short hash suffix is just a dotted name.
        assert_eq!(fingerprint_family(&url("https://a.test/app.v2.js")), None);
    }

    #[test]
    fn source_map_must_be_same_origin() {
        let same = "//# sourceMappingURL=app.js.map";
        assert_eq!(
            same_origin_source_map(same, "https://a.test/static/app.js"),
            Some("https://a.test/static/app.js.map".to_string())
        );

        let absolute_same = "//# sourceMappingURL=https://a.test/maps/app.js.map";
        assert_eq!(
            same_origin_source_map(absolute_same, "https://a.test/static/app.js"),
            Some("https://a.test/maps/app.js.map".to_string())
        );

        let foreign = "//# sourceMappingURL=https://cdn.other.com/app.js.map";
        assert_eq!(
            same_origin_source_map(foreign, "https://a.test/static/app.js"),
            None
        );

        assert_eq!(same_origin_source_map("no maps here", "https://a.test/a.js"), None);
    }
}
