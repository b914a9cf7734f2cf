//! Central manifest plus the streaming codex index.
//!
//! The codex (`codex_index.jsonl`) is append-only and written line by line
//! as artifacts register. The manifest (`manifest.json`) is rewritten
//! atomically on flush: every 50 artifacts, every 60 seconds, and always on
//! terminal events.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use strider_common::{Artifact, Budget, CodexEntry, CrawlStats, EndpointRecord, StriderError};

use crate::family::FamilyRegistry;
use crate::storage::atomic_overwrite;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const CODEX_FILE: &str = "codex_index.jsonl";
pub const INDEX_FILE: &str = "INDEX.md";

const FLUSH_EVERY_ARTIFACTS: u32 = 50;
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCounts {
    pub pages: u32,
    pub js: u32,
    pub api: u32,
}

impl BudgetCounts {
    fn used(budget: &Budget) -> Self {
        Self {
            pages: budget.pages,
            js: budget.js,
            api: budget.api,
        }
    }

    fn max(budget: &Budget) -> Self {
        Self {
            pages: budget.pages_max,
            js: budget.js_max,
            api: budget.api_max,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub target: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub config_hash: String,
    pub depth_max: u32,
    pub budgets_used: BudgetCounts,
    pub budgets_max: BudgetCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRecord {
    pub count: u64,
    pub samples_saved: u32,
    pub skipped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCount {
    pub kind: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub metadata: ManifestMetadata,
    pub files: Vec<Artifact>,
    pub patterns: BTreeMap<String, PatternRecord>,
    pub endpoints: Vec<EndpointRecord>,
    pub errors: Vec<ErrorCount>,
}

impl Manifest {
    /// Load an existing manifest from an output root, if one is there.
    pub fn load(root: &Path) -> Option<Manifest> {
        let path = root.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable manifest");
                None
            }
        }
    }
}

pub struct ManifestSink {
    root: PathBuf,
    manifest: Manifest,
    codex: File,
    unflushed: u32,
    last_flush: Instant,
}

impl ManifestSink {
    /// Open the sink for a run. When the root already holds a manifest from
    /// an interrupted run, its files, patterns, endpoints and original
    /// start time are carried forward.
    pub fn open(root: &Path, mut metadata: ManifestMetadata) -> Result<Self, StriderError> {
        let mut manifest = match Manifest::load(root) {
            Some(prior) => {
                if prior.metadata.config_hash != metadata.config_hash {
                    warn!(
                        prior = %prior.metadata.config_hash,
                        current = %metadata.config_hash,
                        "Config changed since the checkpointed run"
                    );
                }
                metadata.started_at = prior.metadata.started_at;
                info!(files = prior.files.len(), "Resuming manifest");
                Manifest { metadata, ..prior }
            }
            None => Manifest {
                metadata,
                files: Vec::new(),
                patterns: BTreeMap::new(),
                endpoints: Vec::new(),
                errors: Vec::new(),
            },
        };
        manifest.metadata.finished_at = None;
        manifest.metadata.stop_reason = None;

        let codex = OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join(CODEX_FILE))?;

        Ok(Self {
            root: root.to_path_buf(),
            manifest,
            codex,
            unflushed: 0,
            last_flush: Instant::now(),
        })
    }

    pub fn files(&self) -> &[Artifact] {
        &self.manifest.files
    }

    pub fn patterns(&self) -> &BTreeMap<String, PatternRecord> {
        &self.manifest.patterns
    }

    /// Register an artifact: append to the manifest and stream its codex
    /// line immediately.
    pub fn record(&mut self, artifact: Artifact, codex: CodexEntry) -> Result<(), StriderError> {
        let mut line = serde_json::to_string(&codex)
            .map_err(|e| StriderError::Manifest(format!("codex entry: {e}")))?;
        line.push('\n');
        self.codex.write_all(line.as_bytes())?;
        self.codex.flush()?;

        self.manifest.files.push(artifact);
        self.unflushed += 1;
        Ok(())
    }

    pub fn record_endpoints(&mut self, endpoints: Vec<EndpointRecord>) {
        for endpoint in endpoints {
            if !self
                .manifest
                .endpoints
                .iter()
                .any(|e| e.url == endpoint.url && e.source == endpoint.source)
            {
                self.manifest.endpoints.push(endpoint);
            }
        }
    }

    /// Flush when the artifact or time threshold is due.
    pub fn maybe_flush(
        &mut self,
        families: &FamilyRegistry,
        budget: &Budget,
        errors: &BTreeMap<String, u64>,
    ) -> Result<bool, StriderError> {
        if self.unflushed >= FLUSH_EVERY_ARTIFACTS
            || (self.unflushed > 0 && self.last_flush.elapsed() >= FLUSH_INTERVAL)
        {
            self.flush(families, budget, errors)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn flush(
        &mut self,
        families: &FamilyRegistry,
        budget: &Budget,
        errors: &BTreeMap<String, u64>,
    ) -> Result<(), StriderError> {
        self.sync_tables(families, budget, errors);
        let json = serde_json::to_string_pretty(&self.manifest)
            .map_err(|e| StriderError::Manifest(e.to_string()))?;
        atomic_overwrite(&self.root.join(MANIFEST_FILE), json.as_bytes())?;
        info!(
            files = self.manifest.files.len(),
            unflushed = self.unflushed,
            "flush"
        );
        self.unflushed = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Terminal flush: stamp the end time and stop reason, rewrite the
    /// manifest one last time and emit the human-readable `INDEX.md`.
    pub fn finalize(
        &mut self,
        families: &FamilyRegistry,
        budget: &Budget,
        errors: &BTreeMap<String, u64>,
        stats: &CrawlStats,
        stop_reason: &str,
    ) -> Result<(), StriderError> {
        self.manifest.metadata.finished_at = Some(Utc::now());
        self.manifest.metadata.stop_reason = Some(stop_reason.to_string());
        self.flush(families, budget, errors)?;
        let index = self.render_index(stats);
        atomic_overwrite(&self.root.join(INDEX_FILE), index.as_bytes())?;
        Ok(())
    }

    fn sync_tables(
        &mut self,
        families: &FamilyRegistry,
        budget: &Budget,
        errors: &BTreeMap<String, u64>,
    ) {
        for (key, record) in families.iter() {
            self.manifest.patterns.insert(
                key.clone(),
                PatternRecord {
                    count: record.count,
                    samples_saved: record.samples_saved,
                    skipped: record.skipped,
                },
            );
        }
        self.manifest.metadata.budgets_used = BudgetCounts::used(budget);
        self.manifest.metadata.budgets_max = BudgetCounts::max(budget);
        self.manifest.errors = errors
            .iter()
            .map(|(kind, count)| ErrorCount {
                kind: kind.clone(),
                count: *count,
            })
            .collect();
    }

    fn render_index(&self, stats: &CrawlStats) -> String {
        let meta = &self.manifest.metadata;
        let mut out = String::new();
        out.push_str(&format!("# Recon of {}\n\n", meta.target));
        out.push_str(&format!("- Run: `{}`\n", meta.run_id));
        out.push_str(&format!("- Started: {}\n", meta.started_at.to_rfc3339()));
        if let Some(finished) = meta.finished_at {
            out.push_str(&format!("- Finished: {}\n", finished.to_rfc3339()));
        }
        if let Some(reason) = &meta.stop_reason {
            out.push_str(&format!("- Stopped: {reason}\n"));
        }
        out.push_str(&format!(
            "- Budgets: pages {}/{}, js {}/{}, api {}/{}\n\n",
            meta.budgets_used.pages,
            meta.budgets_max.pages,
            meta.budgets_used.js,
            meta.budgets_max.js,
            meta.budgets_used.api,
            meta.budgets_max.api,
        ));

        out.push_str("## Captured\n\n");
        out.push_str(&format!(
            "{} artifacts ({} pages, {} scripts, {} api responses), \
             {} duplicates dropped, {} family-capped, {} redacted.\n\n",
            stats.saved_total(),
            stats.pages_saved,
            stats.js_saved,
            stats.api_saved,
            stats.duplicates,
            stats.family_skipped,
            stats.redacted,
        ));

        if !self.manifest.endpoints.is_empty() {
            out.push_str("## Endpoints\n\n");
            for endpoint in &self.manifest.endpoints {
                out.push_str(&format!(
                    "- `{}` (seen in {})\n",
                    endpoint.url, endpoint.source
                ));
            }
            out.push('\n');
        }

        let mut saturated: Vec<(&String, &PatternRecord)> = self
            .manifest
            .patterns
            .iter()
            .filter(|(_, r)| r.skipped > 0)
            .collect();
        if !saturated.is_empty() {
            saturated.sort_by(|a, b| b.1.count.cmp(&a.1.count));
            out.push_str("## Saturated families\n\n");
            for (key, record) in saturated.into_iter().take(20) {
                out.push_str(&format!(
                    "- `{key}`: {} hits, {} saved, {} skipped\n",
                    record.count, record.samples_saved, record.skipped
                ));
            }
            out.push('\n');
        }

        if !self.manifest.errors.is_empty() {
            out.push_str("## Errors\n\n");
            for error in &self.manifest.errors {
                out.push_str(&format!("- {}: {}\n", error.kind, error.count));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strider_common::ArtifactKind;

    fn metadata() -> ManifestMetadata {
        ManifestMetadata {
            target: "https://a.test".to_string(),
            run_id: "run-1".to_string(),
            started_at: Utc::now(),
            finished_at: None,
            config_hash: "cafe".to_string(),
            depth_max: 3,
            budgets_used: BudgetCounts {
                pages: 0,
                js: 0,
                api: 0,
            },
            budgets_max: BudgetCounts {
                pages: 5,
                js: 5,
                api: 5,
            },
            stop_reason: None,
        }
    }

    fn artifact(sha: &str) -> Artifact {
        Artifact {
            kind: ArtifactKind::Html,
            url: format!("https://a.test/{sha}"),
            path: format!("pages/{sha}.html"),
            sha256: sha.to_string(),
            size: 10,
            status: 200,
            depth: 0,
            captured_at: Utc::now(),
            redacted: false,
            signal: None,
        }
    }

    fn codex(sha: &str) -> CodexEntry {
        CodexEntry {
            path: format!("pages/{sha}.html"),
            kind: ArtifactKind::Html,
            sha256: sha.to_string(),
            url: format!("https://a.test/{sha}"),
            priority: 0.5,
            hints: vec![],
        }
    }

    #[test]
    fn codex_lines_stream_immediately() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut sink = ManifestSink::open(dir.path(), metadata()).unwrap();
        sink.record(artifact("aa"), codex("aa")).unwrap();
        sink.record(artifact("bb"), codex("bb")).unwrap();

        let lines: Vec<String> = std::fs::read_to_string(dir.path().join(CODEX_FILE))
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        assert_eq!(lines.len(), 2);
        let first: CodexEntry = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first.sha256, "aa");
    }

    #[test]
    fn flush_writes_manifest_and_resets_counter() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut sink = ManifestSink::open(dir.path(), metadata()).unwrap();
        let families = FamilyRegistry::new(3, 3.5);
        let budget = Budget::new(5, 5, 5);
        let errors = BTreeMap::new();

        sink.record(artifact("aa"), codex("aa")).unwrap();
        sink.flush(&families, &budget, &errors).unwrap();

        let loaded = Manifest::load(dir.path()).unwrap();
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.metadata.run_id, "run-1");
    }

    #[test]
    fn reopen_carries_files_and_start_time_forward() {
        let dir = tempfile::TempDir::new().unwrap();
        let started;
        {
            let mut sink = ManifestSink::open(dir.path(), metadata()).unwrap();
            started = sink.manifest.metadata.started_at;
            sink.record(artifact("aa"), codex("aa")).unwrap();
            sink.flush(&FamilyRegistry::new(3, 3.5), &Budget::new(5, 5, 5), &BTreeMap::new())
                .unwrap();
        }
        let mut second = metadata();
        second.run_id = "run-2".to_string();
        let sink = ManifestSink::open(dir.path(), second).unwrap();
        assert_eq!(sink.files().len(), 1);
        assert_eq!(sink.manifest.metadata.started_at, started);
        assert_eq!(sink.manifest.metadata.run_id, "run-2");
    }

    #[test]
    fn endpoints_deduplicate() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut sink = ManifestSink::open(dir.path(), metadata()).unwrap();
        let endpoint = EndpointRecord {
            url: "https://a.test/api/login".to_string(),
            source: "js".to_string(),
            score: 0.7,
        };
        sink.record_endpoints(vec![endpoint.clone(), endpoint.clone()]);
        sink.record_endpoints(vec![endpoint]);
        assert_eq!(sink.manifest.endpoints.len(), 1);
    }

    #[test]
    fn finalize_writes_index_md() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut sink = ManifestSink::open(dir.path(), metadata()).unwrap();
        sink.record(artifact("aa"), codex("aa")).unwrap();
        sink.finalize(
            &FamilyRegistry::new(3, 3.5),
            &Budget::new(5, 5, 5),
            &BTreeMap::new(),
            &CrawlStats::default(),
            "pages-budget",
        )
        .unwrap();

        let index = std::fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        assert!(index.contains("# Recon of https://a.test"));
        assert!(index.contains("pages-budget"));

        let manifest = Manifest::load(dir.path()).unwrap();
        assert!(manifest.metadata.finished_at.is_some());
        assert_eq!(manifest.metadata.stop_reason.as_deref(), Some("pages-budget"));
    }
}
