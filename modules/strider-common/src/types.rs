use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of content an artifact holds. Drives budget accounting and
/// storage placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Html,
    Js,
    Api,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Html => "html",
            ArtifactKind::Js => "js",
            ArtifactKind::Api => "api",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A saved file plus its metadata record. Appended to the manifest exactly
/// once; never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub url: String,
    /// Path relative to the output root.
    pub path: String,
    /// sha256 of the bytes as fetched. For redacted API bodies this is the
    /// hash of the original, pre-redaction bytes.
    pub sha256: String,
    pub size: u64,
    pub status: u16,
    pub depth: u32,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub redacted: bool,
    /// JS only: did endpoint extraction find anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<bool>,
}

/// One line of `codex_index.jsonl`: a lightweight, prioritized pointer to an
/// artifact for downstream consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexEntry {
    pub path: String,
    pub kind: ArtifactKind,
    pub sha256: String,
    pub url: String,
    pub priority: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

/// An endpoint candidate surfaced during processing, recorded in the
/// manifest regardless of whether it was in scope to fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub url: String,
    /// Where it was seen: "js", "html" or "api".
    pub source: String,
    pub score: f64,
}

/// Per-kind artifact budget. Counters are monotone non-decreasing for the
/// lifetime of a run; the orchestrator halts at the first `used >= max`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub pages: u32,
    pub js: u32,
    pub api: u32,
    pub pages_max: u32,
    pub js_max: u32,
    pub api_max: u32,
}

impl Budget {
    pub fn new(pages_max: u32, js_max: u32, api_max: u32) -> Self {
        Self {
            pages: 0,
            js: 0,
            api: 0,
            pages_max,
            js_max,
            api_max,
        }
    }

    pub fn consume(&mut self, kind: ArtifactKind) {
        match kind {
            ArtifactKind::Html => self.pages += 1,
            ArtifactKind::Js => self.js += 1,
            ArtifactKind::Api => self.api += 1,
        }
    }

    pub fn used(&self, kind: ArtifactKind) -> u32 {
        match kind {
            ArtifactKind::Html => self.pages,
            ArtifactKind::Js => self.js,
            ArtifactKind::Api => self.api,
        }
    }

    pub fn max(&self, kind: ArtifactKind) -> u32 {
        match kind {
            ArtifactKind::Html => self.pages_max,
            ArtifactKind::Js => self.js_max,
            ArtifactKind::Api => self.api_max,
        }
    }

    /// First exhausted kind, if any.
    pub fn exhausted(&self) -> Option<ArtifactKind> {
        [ArtifactKind::Html, ArtifactKind::Js, ArtifactKind::Api]
            .into_iter()
            .find(|k| self.used(*k) >= self.max(*k))
    }

    /// Rebuild from a checkpointed budget, keeping the current config's caps
    /// but carrying over consumed counters.
    pub fn restored(&self, saved: &Budget) -> Budget {
        Budget {
            pages: saved.pages,
            js: saved.js,
            api: saved.api,
            ..self.clone()
        }
    }
}

/// Running tallies for a crawl, reported in the final summary and `INDEX.md`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlStats {
    pub fetched: u32,
    pub pages_saved: u32,
    pub js_saved: u32,
    pub api_saved: u32,
    pub duplicates: u32,
    pub family_skipped: u32,
    pub redacted: u32,
    pub out_of_scope: u32,
    pub failed: u32,
}

impl CrawlStats {
    pub fn saved_total(&self) -> u32 {
        self.pages_saved + self.js_saved + self.api_saved
    }
}

impl std::fmt::Display for CrawlStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "fetched={} saved={} (pages={} js={} api={}) duplicates={} family_skipped={} redacted={} out_of_scope={} failed={}",
            self.fetched,
            self.saved_total(),
            self.pages_saved,
            self.js_saved,
            self.api_saved,
            self.duplicates,
            self.family_skipped,
            self.redacted,
            self.out_of_scope,
            self.failed,
        )
    }
}
