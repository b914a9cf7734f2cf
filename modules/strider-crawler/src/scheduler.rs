//! Priority scheduling of crawl work. The scheduler exclusively owns the
//! queue and the pending set; dedup and family state are read through
//! references at enqueue time.

use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use strider_common::config::ScoringWeights;
use strider_common::{ArtifactKind, Budget};

use crate::canonical::{CanonicalUrl, Canonicalizer};
use crate::dedup::{pagination_sibling_key, DedupIndex};
use crate::family::FamilyRegistry;
use crate::scope::{ScopeGuard, ScopeReject};

/// Path markers that usually lead somewhere interesting on a recon crawl.
const SIGNAL_SEGMENTS: &[&str] = &[
    "/api", "/graphql", "/auth", "/admin", "/config", "/v1", "/v2",
];

/// Minimum fetch attempts before the error-rate stop condition can fire.
const ERROR_RATE_MIN_ATTEMPTS: u64 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkMeta {
    pub depth: u32,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub url_key: String,
    pub url: String,
    pub meta: WorkMeta,
    pub score: f64,
}

/// Heap entry: score descending, insertion order ascending within ties.
struct QueueEntry {
    item: WorkItem,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.item
            .score
            .total_cmp(&other.item.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Queued { score: f64 },
    OutOfScope(ScopeReject),
    SeenUrl,
    AlreadyPending,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    PagesBudget,
    JsBudget,
    ApiBudget,
    TimeLimit,
    ErrorRate,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::PagesBudget => "pages-budget",
            StopReason::JsBudget => "js-budget",
            StopReason::ApiBudget => "api-budget",
            StopReason::TimeLimit => "time-limit",
            StopReason::ErrorRate => "error-rate",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StopPolicy {
    pub time_max: Duration,
    pub error_rate_max: f64,
}

/// Serializable view of the queue for checkpointing, highest priority first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub pending: Vec<WorkItem>,
}

pub struct Scheduler {
    heap: BinaryHeap<QueueEntry>,
    pending: HashSet<String>,
    seq: u64,
    weights: ScoringWeights,
    policy: StopPolicy,
    seen_hosts: HashSet<String>,
    seen_path_roots: HashSet<String>,
    processed: u64,
    skipped: u64,
    failed: u64,
}

impl Scheduler {
    pub fn new(weights: ScoringWeights, policy: StopPolicy) -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashSet::new(),
            seq: 0,
            weights,
            policy,
            seen_hosts: HashSet::new(),
            seen_path_roots: HashSet::new(),
            processed: 0,
            skipped: 0,
            failed: 0,
        }
    }

    /// Canonicalize, gate, score and insert a raw URL. `force` bypasses the
    /// seen-set gate (seeds); scope and pending membership are always
    /// enforced, so out-of-scope input never queues and a key sits in the
    /// queue only once. Checkpoint restore goes through `restore`, which
    /// re-checks nothing.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &mut self,
        raw: &str,
        base: Option<&Url>,
        meta: WorkMeta,
        force: bool,
        canon: &Canonicalizer,
        scope: &ScopeGuard,
        dedup: &DedupIndex,
        families: &FamilyRegistry,
    ) -> EnqueueOutcome {
        let url = match canon.canonicalize(raw, base) {
            Ok(url) => url,
            Err(_) => return EnqueueOutcome::Invalid,
        };

        if let Some(reason) = scope.rejection(&url) {
            return EnqueueOutcome::OutOfScope(reason);
        }
        if !force && dedup.seen_url(&url.url_key) {
            return EnqueueOutcome::SeenUrl;
        }
        if self.pending.contains(&url.url_key) {
            return EnqueueOutcome::AlreadyPending;
        }

        let family_key = families.key_for(&url);
        let score = self.score(&url, meta.depth, families.count(&family_key), families, dedup);

        let item = WorkItem {
            url_key: url.url_key.clone(),
            url: url.canonical.clone(),
            meta,
            score,
        };
        debug!(url = %item.url, score, reason = %item.meta.reason, "enqueue");
        self.push(item);
        EnqueueOutcome::Queued { score }
    }

    /// Highest-score item, FIFO within equal scores.
    pub fn dequeue(&mut self) -> Option<WorkItem> {
        let entry = self.heap.pop()?;
        self.pending.remove(&entry.item.url_key);
        Some(entry.item)
    }

    pub fn pending_len(&self) -> usize {
        self.heap.len()
    }

    pub fn mark_processed(&mut self, item: &WorkItem) {
        self.processed += 1;
        debug!(url = %item.url, "processed");
    }

    pub fn mark_skipped(&mut self, item: &WorkItem, reason: &str) {
        self.skipped += 1;
        debug!(url = %item.url, reason, "skipped");
    }

    pub fn mark_failed(&mut self, item: &WorkItem, error: &str) {
        self.failed += 1;
        debug!(url = %item.url, error, "failed");
    }

    /// Fetch failures over fetch attempts, in [0, 1].
    pub fn error_rate(&self) -> f64 {
        let attempts = self.processed + self.skipped + self.failed;
        if attempts == 0 {
            return 0.0;
        }
        self.failed as f64 / attempts as f64
    }

    /// First matching stop condition, if any.
    pub fn should_stop(&self, budget: &Budget, elapsed: Duration) -> Option<StopReason> {
        if let Some(kind) = budget.exhausted() {
            return Some(match kind {
                ArtifactKind::Html => StopReason::PagesBudget,
                ArtifactKind::Js => StopReason::JsBudget,
                ArtifactKind::Api => StopReason::ApiBudget,
            });
        }
        if elapsed >= self.policy.time_max {
            return Some(StopReason::TimeLimit);
        }
        let attempts = self.processed + self.skipped + self.failed;
        if attempts >= ERROR_RATE_MIN_ATTEMPTS && self.error_rate() >= self.policy.error_rate_max {
            return Some(StopReason::ErrorRate);
        }
        None
    }

    /// Pending items in dequeue order, for the checkpoint.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let mut entries: Vec<&QueueEntry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        SchedulerSnapshot {
            pending: entries.into_iter().map(|e| e.item.clone()).collect(),
        }
    }

    /// Re-enqueue checkpointed items with their persisted scores. Scope and
    /// dedup gates were already passed when they were first queued.
    pub fn restore(&mut self, snapshot: SchedulerSnapshot) -> usize {
        let mut restored = 0;
        for item in snapshot.pending {
            if self.pending.contains(&item.url_key) {
                continue;
            }
            self.push(item);
            restored += 1;
        }
        restored
    }

    fn push(&mut self, item: WorkItem) {
        self.pending.insert(item.url_key.clone());
        self.heap.push(QueueEntry {
            item,
            seq: self.seq,
        });
        self.seq += 1;
    }

    /// Clipped weighted score per the recon heuristics: interesting path
    /// markers and shallow depth raise it, saturated families and known
    /// pagination churn lower it.
    fn score(
        &mut self,
        url: &CanonicalUrl,
        depth: u32,
        family_count: u64,
        families: &FamilyRegistry,
        dedup: &DedupIndex,
    ) -> f64 {
        let w = &self.weights;
        let mut score = 0.0;

        let path_lower = url.path.to_lowercase();
        if SIGNAL_SEGMENTS.iter().any(|s| path_lower.contains(s)) {
            score += w.w_type;
        }

        score += w.w_depth / (1.0 + depth as f64);

        let root = first_path_segment(&url.path)
            .map(|seg| format!("{}/{}", url.host, seg))
            .unwrap_or_else(|| url.host.clone());
        let novel_host = self.seen_hosts.insert(url.host.clone());
        let novel_root = self.seen_path_roots.insert(root);
        if novel_host || novel_root {
            score += w.w_novelty;
        }

        let family_max = families.max_samples().max(1) as f64;
        score -= w.w_family * (family_count as f64 / family_max).min(1.0);

        // Noise: the raw URL carried tracking keys, or it pages through a
        // listing we already sampled with no diff evidence yet. Once a later
        // sibling has diffed enough to be kept, the penalty lifts.
        let pagination_noise = pagination_sibling_key(url)
            .map(|sibling| {
                dedup.pagination_baseline(&sibling).is_some()
                    && !dedup.pagination_diff_evidence(&sibling)
            })
            .unwrap_or(false);
        if url.had_tracking_params || pagination_noise {
            score -= w.w_noise;
        }

        score.clamp(0.0, 1.0)
    }
}

fn first_path_segment(path: &str) -> Option<String> {
    path.split('/').find(|s| !s.is_empty()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strider_common::config::{ContentConfig, TargetConfig};

    fn fixtures() -> (Canonicalizer, ScopeGuard, DedupIndex, FamilyRegistry) {
        let target = TargetConfig {
            base_urls: vec!["https://a.test".into()],
            allowed_domains: vec!["a.test".into()],
            disallowed_paths: vec![],
        };
        (
            Canonicalizer::new(&[], true),
            ScopeGuard::new(&target, &ContentConfig::default()),
            DedupIndex::new(0.92),
            FamilyRegistry::new(3, 3.5),
        )
    }

    fn meta(depth: u32) -> WorkMeta {
        WorkMeta {
            depth,
            reason: "test".to_string(),
            parent: None,
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(
            ScoringWeights::default(),
            StopPolicy {
                time_max: Duration::from_secs(3600),
                error_rate_max: 0.5,
            },
        )
    }

    #[test]
    fn api_path_outranks_brochure_page() {
        let (canon, scope, dedup, families) = fixtures();
        let mut s = scheduler();
        s.enqueue("https://a.test/about-us", None, meta(1), false, &canon, &scope, &dedup, &families);
        s.enqueue("https://a.test/api/v1/users", None, meta(1), false, &canon, &scope, &dedup, &families);

        assert_eq!(s.dequeue().unwrap().url, "https://a.test/api/v1/users");
        assert_eq!(s.dequeue().unwrap().url, "https://a.test/about-us");
        assert!(s.dequeue().is_none());
    }

    #[test]
    fn equal_scores_dequeue_fifo() {
        let (canon, scope, dedup, families) = fixtures();
        let mut s = scheduler();
        // Same depth, same family shape, no signal segments: equal scores
        // apart from the one-time novelty bonus, which the first of each
        // root consumes. Use one shared root so only the first differs.
        for path in ["/docs/a", "/docs/b", "/docs/c"] {
            s.enqueue(
                &format!("https://a.test{path}"),
                None,
                meta(2),
                false,
                &canon,
                &scope,
                &dedup,
                &families,
            );
        }
        let first = s.dequeue().unwrap();
        assert_eq!(first.url, "https://a.test/docs/a");
        assert_eq!(s.dequeue().unwrap().url, "https://a.test/docs/b");
        assert_eq!(s.dequeue().unwrap().url, "https://a.test/docs/c");
    }

    #[test]
    fn out_of_scope_and_duplicates_rejected() {
        let (canon, scope, mut dedup, families) = fixtures();
        let mut s = scheduler();

        assert!(matches!(
            s.enqueue("https://evil.example.com/x", None, meta(0), false, &canon, &scope, &dedup, &families),
            EnqueueOutcome::OutOfScope(ScopeReject::Domain)
        ));
        assert!(matches!(
            s.enqueue("not a url", None, meta(0), false, &canon, &scope, &dedup, &families),
            EnqueueOutcome::Invalid
        ));

        dedup.mark_url(&canon.canonicalize("https://a.test/seen", None).unwrap().url_key);
        assert!(matches!(
            s.enqueue("https://a.test/seen", None, meta(0), false, &canon, &scope, &dedup, &families),
            EnqueueOutcome::SeenUrl
        ));

        assert!(matches!(
            s.enqueue("https://a.test/x", None, meta(0), false, &canon, &scope, &dedup, &families),
            EnqueueOutcome::Queued { .. }
        ));
        assert!(matches!(
            s.enqueue("https://a.test/x", None, meta(0), false, &canon, &scope, &dedup, &families),
            EnqueueOutcome::AlreadyPending
        ));
    }

    #[test]
    fn force_bypasses_seen_but_not_scope_or_pending() {
        let (canon, scope, mut dedup, families) = fixtures();
        let mut s = scheduler();

        // Out-of-scope input stays rejected even when forced.
        assert!(matches!(
            s.enqueue("https://evil.example.com/x", None, meta(0), true, &canon, &scope, &dedup, &families),
            EnqueueOutcome::OutOfScope(_)
        ));

        // A previously seen seed re-queues under force.
        dedup.mark_url(&canon.canonicalize("https://a.test/seed", None).unwrap().url_key);
        assert!(matches!(
            s.enqueue("https://a.test/seed", None, meta(0), true, &canon, &scope, &dedup, &families),
            EnqueueOutcome::Queued { .. }
        ));
        assert!(matches!(
            s.enqueue("https://a.test/seed", None, meta(0), true, &canon, &scope, &dedup, &families),
            EnqueueOutcome::AlreadyPending
        ));
    }

    #[test]
    fn saturated_family_scores_lower() {
        let (canon, scope, dedup, mut families) = fixtures();
        let mut s = scheduler();

        let sample = crate::family::SampleStats {
            title_len: 10,
            body_len: 100,
            status: 200,
        };
        let key = families.key_for(&canon.canonicalize("https://a.test/item/1", None).unwrap());
        for _ in 0..3 {
            families.commit_save(&key, sample);
        }

        let fresh = match s.enqueue("https://a.test/fresh/page", None, meta(1), false, &canon, &scope, &dedup, &families) {
            EnqueueOutcome::Queued { score } => score,
            other => panic!("expected Queued, got {other:?}"),
        };
        let saturated = match s.enqueue("https://a.test/item/42", None, meta(1), false, &canon, &scope, &dedup, &families) {
            EnqueueOutcome::Queued { score } => score,
            other => panic!("expected Queued, got {other:?}"),
        };
        assert!(saturated < fresh, "family penalty should bite: {saturated} vs {fresh}");
    }

    #[test]
    fn tracking_keys_penalize_score() {
        let (_, scope, dedup, families) = fixtures();
        let canon = Canonicalizer::new(&["utm_*".to_string()], true);
        let mut s = scheduler();

        let clean = match s.enqueue("https://a.test/x?a=1", None, meta(1), false, &canon, &scope, &dedup, &families) {
            EnqueueOutcome::Queued { score } => score,
            other => panic!("expected Queued, got {other:?}"),
        };
        let tracked = match s.enqueue("https://a.test/y?a=1&utm_source=mail", None, meta(1), false, &canon, &scope, &dedup, &families) {
            EnqueueOutcome::Queued { score } => score,
            other => panic!("expected Queued, got {other:?}"),
        };
        let w_noise = ScoringWeights::default().w_noise;
        assert!(
            (clean - tracked - w_noise).abs() < 1e-9,
            "tracking keys should cost w_noise: clean={clean} tracked={tracked}"
        );
    }

    #[test]
    fn pagination_penalty_lifts_after_diff_evidence() {
        let (canon, scope, mut dedup, families) = fixtures();
        let mut s = scheduler();

        // Burn the novelty bonus for the host and the listing root so the
        // remaining scores differ only by the noise term.
        s.enqueue("https://a.test/list?category=news", None, meta(1), false, &canon, &scope, &dedup, &families);

        // A sibling is saved (baseline) but nothing has diffed yet: the
        // next page is presumed churn.
        dedup.record_pagination_save("a.test/list?category=news", std::collections::HashSet::new());
        let presumed_churn = match s.enqueue("https://a.test/list?category=news&page=2", None, meta(1), false, &canon, &scope, &dedup, &families) {
            EnqueueOutcome::Queued { score } => score,
            other => panic!("expected Queued, got {other:?}"),
        };

        // A second sibling was kept, so the group has diff evidence and
        // later pages stop being penalized.
        dedup.record_pagination_save("a.test/list?category=news", std::collections::HashSet::new());
        let after_evidence = match s.enqueue("https://a.test/list?category=news&page=3", None, meta(1), false, &canon, &scope, &dedup, &families) {
            EnqueueOutcome::Queued { score } => score,
            other => panic!("expected Queued, got {other:?}"),
        };

        let w_noise = ScoringWeights::default().w_noise;
        assert!(
            (after_evidence - presumed_churn - w_noise).abs() < 1e-9,
            "diff evidence should lift the penalty: before={presumed_churn} after={after_evidence}"
        );
    }

    #[test]
    fn stop_conditions() {
        let s = scheduler();
        let mut budget = Budget::new(1, 5, 5);
        assert!(s.should_stop(&budget, Duration::from_secs(0)).is_none());

        budget.consume(ArtifactKind::Html);
        assert_eq!(
            s.should_stop(&budget, Duration::from_secs(0)),
            Some(StopReason::PagesBudget)
        );

        let budget = Budget::new(5, 5, 5);
        assert_eq!(
            s.should_stop(&budget, Duration::from_secs(7200)),
            Some(StopReason::TimeLimit)
        );
    }

    #[test]
    fn error_rate_stop_needs_minimum_attempts() {
        let (canon, scope, dedup, families) = fixtures();
        let mut s = scheduler();
        let budget = Budget::new(5, 5, 5);

        let mut item_for = |path: &str, s: &mut Scheduler| {
            s.enqueue(&format!("https://a.test{path}"), None, meta(0), false, &canon, &scope, &dedup, &families);
            s.dequeue().unwrap()
        };

        for i in 0..4 {
            let item = item_for(&format!("/f{i}"), &mut s);
            s.mark_failed(&item, "boom");
        }
        // 4 attempts, 100% failure, but still below the minimum attempt floor.
        assert!(s.should_stop(&budget, Duration::from_secs(0)).is_none());

        for i in 0..4 {
            let item = item_for(&format!("/g{i}"), &mut s);
            s.mark_failed(&item, "boom");
        }
        assert_eq!(
            s.should_stop(&budget, Duration::from_secs(0)),
            Some(StopReason::ErrorRate)
        );
    }

    #[test]
    fn snapshot_restore_preserves_order_and_scores() {
        let (canon, scope, dedup, families) = fixtures();
        let mut s = scheduler();
        for path in ["/api/one", "/about", "/api/two"] {
            s.enqueue(&format!("https://a.test{path}"), None, meta(1), false, &canon, &scope, &dedup, &families);
        }

        let snapshot = s.snapshot();
        assert_eq!(snapshot.pending.len(), 3);
        // Snapshot is ordered like the dequeue sequence would be.
        assert!(snapshot.pending[0].url.contains("/api/"));

        let mut restored = scheduler();
        assert_eq!(restored.restore(snapshot.clone()), 3);
        let original: Vec<String> = std::iter::from_fn(|| s.dequeue()).map(|i| i.url).collect();
        let replayed: Vec<String> =
            std::iter::from_fn(|| restored.dequeue()).map(|i| i.url).collect();
        assert_eq!(original, replayed);
    }
}
