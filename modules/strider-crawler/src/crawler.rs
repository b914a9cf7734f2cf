//! The orchestrator: one supervised loop driving dequeue → fetch → route →
//! process → register → checkpoint. All shared mutable state lives here and
//! is touched sequentially; parallelism stays inside the fetcher.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use strider_common::config::{Config, FetcherMode};
use strider_common::{ArtifactKind, Budget, CrawlStats};

use crate::canonical::{url_key_of, CanonicalUrl, Canonicalizer};
use crate::checkpoint::Checkpoint;
use crate::dedup::DedupIndex;
use crate::family::FamilyRegistry;
use crate::fetcher::{
    BrowserlessFetcher, Fetch, FetchResponse, FetchStrategy, HttpFetcher, WaitFor,
};
use crate::manifest::{BudgetCounts, Manifest, ManifestMetadata, ManifestSink};
use crate::processors::{self, ProcessError, ProcessOutcome, ProcessorDeps, Verdict};
use crate::router::{route, Routed};
use crate::scheduler::{EnqueueOutcome, Scheduler, StopPolicy, WorkItem, WorkMeta};
use crate::scope::ScopeGuard;
use crate::storage::Storage;

/// Build the transport the config asks for.
pub fn build_fetcher(config: &Config) -> anyhow::Result<Arc<dyn Fetch>> {
    Ok(match config.fetcher.mode {
        FetcherMode::Http => Arc::new(HttpFetcher::new(
            &config.crawl,
            &config.fetcher,
            &config.auth,
        )?),
        FetcherMode::Browserless => Arc::new(BrowserlessFetcher::new(
            &config.crawl,
            &config.fetcher,
            &config.auth,
        )?),
    })
}

pub struct Crawler {
    config: Config,
    fetcher: Arc<dyn Fetch>,
    cancel: Arc<AtomicBool>,
    run_id: String,
    started_at: DateTime<Utc>,
    resumed: bool,

    canon: Canonicalizer,
    scope: ScopeGuard,
    scheduler: Scheduler,
    dedup: DedupIndex,
    families: FamilyRegistry,
    storage: Storage,
    manifest: ManifestSink,
    budget: Budget,
    stats: CrawlStats,
    errors: BTreeMap<String, u64>,
}

impl Crawler {
    /// Wire up the full crawl context. Restores checkpointed pending work
    /// and rebuilds the seen sets from the manifest when the output root
    /// already holds an interrupted run.
    pub fn new(config: Config, fetcher: Arc<dyn Fetch>) -> anyhow::Result<Self> {
        let storage = Storage::new(&config.output)
            .context("output root is not writable")?;
        let root = config.output.root_dir.clone();

        let canon = Canonicalizer::new(
            &config.crawl.normalize_query.drop_params,
            config.crawl.normalize_query.sort_params,
        );
        let scope = ScopeGuard::new(&config.target, &config.content);
        let mut dedup = DedupIndex::new(config.heuristics.html_similarity_drop);
        let mut families = FamilyRegistry::new(
            config.heuristics.family_max_samples,
            config.heuristics.family_threshold,
        );
        let scheduler = Scheduler::new(
            config.scoring,
            StopPolicy {
                time_max: Duration::from_secs(config.fetcher.time_max_s),
                error_rate_max: config.fetcher.error_rate_max,
            },
        );

        let budgets = &config.crawl.budgets;
        let mut budget = Budget::new(budgets.pages_max, budgets.js_max, budgets.api_max);

        let checkpoint = Checkpoint::load(&root);
        let mut started_at = Utc::now();
        if let Some(ref prior) = checkpoint {
            started_at = prior.started_at;
            budget = budget.restored(&prior.budget);
        }

        if let Some(prior) = Manifest::load(&root) {
            for artifact in &prior.files {
                dedup.mark_content(&artifact.sha256);
                dedup.mark_url(&url_key_of(&artifact.url));
            }
            for (key, pattern) in &prior.patterns {
                families.seed(key, pattern.count, pattern.samples_saved, pattern.skipped);
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let metadata = ManifestMetadata {
            target: config.primary_target().to_string(),
            run_id: run_id.clone(),
            started_at,
            finished_at: None,
            config_hash: config.config_hash.clone(),
            depth_max: config.crawl.depth_max,
            budgets_used: BudgetCounts {
                pages: budget.pages,
                js: budget.js,
                api: budget.api,
            },
            budgets_max: BudgetCounts {
                pages: budget.pages_max,
                js: budget.js_max,
                api: budget.api_max,
            },
            stop_reason: None,
        };
        let manifest = ManifestSink::open(&root, metadata)?;

        let mut crawler = Self {
            config,
            fetcher,
            cancel: Arc::new(AtomicBool::new(false)),
            run_id,
            started_at,
            resumed: checkpoint.is_some(),
            canon,
            scope,
            scheduler,
            dedup,
            families,
            storage,
            manifest,
            budget,
            stats: CrawlStats::default(),
            errors: BTreeMap::new(),
        };

        if let Some(prior) = checkpoint {
            let restored = crawler.scheduler.restore(prior.pending);
            info!(restored, "checkpoint");
        }
        crawler.enqueue_seeds();
        Ok(crawler)
    }

    /// Flag observed between iterations; a signal handler flips it for a
    /// clean stop with a final flush and checkpoint.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn enqueue_seeds(&mut self) {
        let seeds: Vec<String> = self.config.target.base_urls.clone();
        for seed in seeds {
            let meta = WorkMeta {
                depth: 0,
                reason: "seed".to_string(),
                parent: None,
            };
            // A fresh run forces seeds in; a resumed one lets the rebuilt
            // seen-set drop the ones already processed.
            let outcome = self.scheduler.enqueue(
                &seed,
                None,
                meta,
                !self.resumed,
                &self.canon,
                &self.scope,
                &self.dedup,
                &self.families,
            );
            debug!(seed = %seed, outcome = ?outcome, "seed enqueue");
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<CrawlStats> {
        let clock = Instant::now();
        let strategy = FetchStrategy {
            wait_for: WaitFor::DomContentLoaded,
            timeout_ms: self.config.crawl.timeout_ms,
        };
        info!(
            site = self.config.primary_target(),
            run_id = %self.run_id,
            pending = self.scheduler.pending_len(),
            "Crawl starting"
        );

        let stop_reason: String = loop {
            if self.cancel.load(Ordering::Relaxed) {
                info!("Cancellation requested, stopping after current iteration");
                break "cancelled".to_string();
            }
            if let Some(reason) = self.scheduler.should_stop(&self.budget, clock.elapsed()) {
                break reason.as_str().to_string();
            }
            let Some(item) = self.scheduler.dequeue() else {
                break "exhausted".to_string();
            };
            debug!(url = %item.url, score = item.score, "dequeue");

            // At-most-once: the key is burned the moment it leaves the queue.
            self.dedup.mark_url(&item.url_key);

            let canonical = match self.canon.canonicalize(&item.url, None) {
                Ok(c) => c,
                Err(e) => {
                    warn!(url = %item.url, error = %e, "queued url no longer parses");
                    self.tally("invalid-url");
                    continue;
                }
            };

            let response = match self.fetcher.fetch(&item.url, &strategy).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(url = %item.url, kind = e.kind(), error = %e, "fetch failed");
                    self.tally(e.kind());
                    self.stats.failed += 1;
                    self.scheduler.mark_failed(&item, e.kind());
                    self.write_checkpoint(Some(&item.url));
                    continue;
                }
            };
            self.stats.fetched += 1;
            info!(url = %item.url, status = response.status, "fetch");

            let routed = route(
                response.content_type.as_deref(),
                &canonical.path,
                &self.config.content.include_types,
            );
            if routed == Routed::Binary {
                self.tally("unsupported-content-type");
                self.scheduler.mark_skipped(&item, "binary");
                self.write_checkpoint(Some(&item.url));
                continue;
            }

            match self.process_one(&item, &canonical, &response, routed) {
                Ok(applied) => {
                    if applied {
                        self.process_subresources(&item, &response)?;
                    }
                    self.scheduler.mark_processed(&item);
                }
                Err(e) => {
                    if e.is_fatal() {
                        error!(url = %item.url, error = %e, "fatal processing error");
                        self.emergency_stop("fatal-error");
                        return Err(e.into());
                    }
                    warn!(url = %item.url, kind = e.kind(), error = %e, "processing failed");
                    self.tally(e.kind());
                    self.scheduler.mark_failed(&item, e.kind());
                }
            }

            self.write_checkpoint(Some(&item.url));
            self.manifest
                .maybe_flush(&self.families, &self.budget, &self.errors)
                .context("manifest flush failed")?;
        };

        self.finish(&stop_reason)?;
        Ok(self.stats.clone())
    }

    /// Route one response through its processor and apply the outcome.
    /// Returns whether processing went far enough to look at subresources.
    fn process_one(
        &mut self,
        item: &WorkItem,
        canonical: &CanonicalUrl,
        response: &FetchResponse,
        routed: Routed,
    ) -> Result<bool, ProcessError> {
        if self.kind_is_full(routed) {
            self.scheduler.mark_skipped(item, "budget-exhausted");
            return Ok(false);
        }

        let mut deps = ProcessorDeps {
            dedup: &mut self.dedup,
            families: &mut self.families,
            storage: &mut self.storage,
            heuristics: &self.config.heuristics,
        };
        let outcome = match routed {
            Routed::Html => processors::html::process(item, canonical, response, &mut deps)?,
            Routed::Js => processors::js::process(item, canonical, response, &mut deps)?,
            Routed::Api => processors::api::process(item, canonical, response, &mut deps)?,
            Routed::Binary => return Ok(false),
        };
        self.apply_outcome(item, canonical, outcome)?;
        Ok(true)
    }

    fn apply_outcome(
        &mut self,
        item: &WorkItem,
        canonical: &CanonicalUrl,
        outcome: ProcessOutcome,
    ) -> Result<(), ProcessError> {
        match outcome.verdict {
            Verdict::Saved => {
                if let (Some(artifact), Some(codex)) = (outcome.artifact, outcome.codex) {
                    info!(
                        kind = artifact.kind.as_str(),
                        path = %artifact.path,
                        sha256 = %artifact.sha256,
                        "artifact"
                    );
                    self.budget.consume(artifact.kind);
                    match artifact.kind {
                        ArtifactKind::Html => self.stats.pages_saved += 1,
                        ArtifactKind::Js => self.stats.js_saved += 1,
                        ArtifactKind::Api => self.stats.api_saved += 1,
                    }
                    if artifact.redacted {
                        info!(url = %artifact.url, "redacted");
                        self.stats.redacted += 1;
                    }
                    self.manifest.record(artifact, codex)?;
                }
            }
            Verdict::Duplicate => {
                info!(url = %canonical.canonical, "duplicate");
                self.stats.duplicates += 1;
            }
            Verdict::FamilySkipped => {
                info!(url = %canonical.canonical, "family-skipped");
                self.stats.family_skipped += 1;
            }
            Verdict::PaginationSkipped => {
                info!(url = %canonical.canonical, reason = "pagination", "skip");
                self.stats.family_skipped += 1;
            }
        }

        self.manifest.record_endpoints(outcome.endpoints);

        let next_depth = item.meta.depth + 1;
        if next_depth > self.config.crawl.depth_max {
            return Ok(());
        }
        let base = Url::parse(&canonical.canonical).ok();
        for discovered in outcome.discovered {
            let meta = WorkMeta {
                depth: next_depth,
                reason: discovered.reason.to_string(),
                parent: Some(item.url.clone()),
            };
            let result = self.scheduler.enqueue(
                &discovered.url,
                base.as_ref(),
                meta,
                false,
                &self.canon,
                &self.scope,
                &self.dedup,
                &self.families,
            );
            match result {
                EnqueueOutcome::OutOfScope(reason) => {
                    // Parent was in scope, so the rejection is worth a line.
                    debug!(
                        url = %discovered.url,
                        parent = %item.url,
                        reason = reason.as_str(),
                        "skip"
                    );
                    self.stats.out_of_scope += 1;
                    self.tally("out-of-scope");
                }
                EnqueueOutcome::Invalid => self.tally("invalid-url"),
                _ => {}
            }
        }
        Ok(())
    }

    /// Rendered pages can carry captured subresources; in-scope JS and API
    /// bodies among them are processed without another fetch.
    fn process_subresources(
        &mut self,
        item: &WorkItem,
        response: &FetchResponse,
    ) -> anyhow::Result<()> {
        if response.subresources.is_empty() {
            return Ok(());
        }
        let base = Url::parse(&item.url).ok();
        for sub in &response.subresources {
            let Ok(canonical) = self.canon.canonicalize(&sub.url, base.as_ref()) else {
                continue;
            };
            if self.scope.rejection(&canonical).is_some()
                || self.dedup.seen_url(&canonical.url_key)
            {
                continue;
            }
            let routed = route(
                sub.content_type.as_deref(),
                &canonical.path,
                &self.config.content.include_types,
            );
            // Pages come from the main loop; subresources only add assets.
            if !matches!(routed, Routed::Js | Routed::Api) {
                continue;
            }

            self.dedup.mark_url(&canonical.url_key);
            let sub_item = WorkItem {
                url_key: canonical.url_key.clone(),
                url: canonical.canonical.clone(),
                meta: WorkMeta {
                    depth: item.meta.depth + 1,
                    reason: "subresource".to_string(),
                    parent: Some(item.url.clone()),
                },
                score: item.score,
            };
            let sub_response = FetchResponse {
                final_url: canonical.canonical.clone(),
                status: sub.status,
                headers: Default::default(),
                content_type: sub.content_type.clone(),
                body: sub.body.clone(),
                rendered_html: None,
                subresources: Vec::new(),
            };

            match self.process_one(&sub_item, &canonical, &sub_response, routed) {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    self.emergency_stop("fatal-error");
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(url = %sub_item.url, kind = e.kind(), "subresource processing failed");
                    self.tally(e.kind());
                }
            }
        }
        Ok(())
    }

    fn kind_is_full(&self, routed: Routed) -> bool {
        let kind = match routed {
            Routed::Html => ArtifactKind::Html,
            Routed::Js => ArtifactKind::Js,
            Routed::Api => ArtifactKind::Api,
            Routed::Binary => return true,
        };
        self.budget.used(kind) >= self.budget.max(kind)
    }

    fn tally(&mut self, kind: &str) {
        *self.errors.entry(kind.to_string()).or_insert(0) += 1;
    }

    /// Persist the checkpoint. Mid-run persistence failures are logged and
    /// survived; the next iteration tries again.
    fn write_checkpoint(&mut self, last_url: Option<&str>) {
        let checkpoint = Checkpoint::new(
            last_url.map(String::from),
            self.scheduler.snapshot(),
            self.budget.clone(),
            self.started_at,
        );
        match checkpoint.save(self.storage.root()) {
            Ok(()) => debug!(pending = self.scheduler.pending_len(), "checkpoint"),
            Err(e) => {
                warn!(error = %e, "checkpoint write failed");
                self.tally("checkpoint-io");
            }
        }
    }

    fn finish(&mut self, stop_reason: &str) -> anyhow::Result<()> {
        info!(reason = stop_reason, "stop");
        self.manifest
            .finalize(&self.families, &self.budget, &self.errors, &self.stats, stop_reason)
            .context("final manifest flush failed")?;
        self.write_checkpoint(None);
        if self.config.git.enable {
            info!(
                repo = %self.config.git.repo,
                branch = %self.config.git.branch,
                "Output tree ready for git hand-off"
            );
        }
        info!(stats = %self.stats, "summary");
        Ok(())
    }

    /// Best-effort flush + checkpoint on the way out of a fatal error.
    fn emergency_stop(&mut self, reason: &str) {
        if let Err(e) = self
            .manifest
            .finalize(&self.families, &self.budget, &self.errors, &self.stats, reason)
        {
            warn!(error = %e, "emergency manifest flush failed");
        }
        self.write_checkpoint(None);
    }
}
