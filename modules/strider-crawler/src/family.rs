//! URL family generalization and per-family sample quotas.
//!
//! Structurally identical endpoints (`/store/item/1`, `/store/item/2`, ...)
//! collapse to one pattern key so the crawl keeps a few representative
//! samples instead of a thousand near-identical artifacts.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use strider_common::redact::shannon_entropy;

use crate::canonical::CanonicalUrl;

static NUMERIC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+$").expect("valid regex"));
static HEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{8,}$").expect("valid regex"));
static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("valid regex")
});

/// Query parameter names whose values are collapsed to `{id}`.
const ID_PARAMS: &[&str] = &["id", "item", "ref"];

/// Minimum segment length before the entropy rule applies.
const ENTROPY_MIN_LEN: usize = 12;

/// Shape stats of a saved sample, kept per family for the outlier rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleStats {
    pub title_len: usize,
    pub body_len: usize,
    pub status: u16,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FamilyRecord {
    pub count: u64,
    pub samples_saved: u32,
    pub skipped: u64,
    #[serde(skip)]
    first_sample: Option<SampleStats>,
}

/// Whether a candidate may be saved under its family's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyVerdict {
    Save,
    Saturated,
}

pub struct FamilyRegistry {
    max_samples: u32,
    entropy_threshold: f64,
    families: HashMap<String, FamilyRecord>,
}

impl FamilyRegistry {
    pub fn new(max_samples: u32, entropy_threshold: f64) -> Self {
        Self {
            max_samples,
            entropy_threshold,
            families: HashMap::new(),
        }
    }

    pub fn max_samples(&self) -> u32 {
        self.max_samples
    }

    /// `host + generalized path + normalized query shape`.
    pub fn key_for(&self, url: &CanonicalUrl) -> String {
        let mut key = url.host.clone();
        key.push_str(&self.generalize_path(&url.path));
        if let Some(shape) = url.query.as_deref().map(query_shape) {
            if !shape.is_empty() {
                key.push('?');
                key.push_str(&shape);
            }
        }
        key
    }

    fn generalize_path(&self, path: &str) -> String {
        let mut out = String::with_capacity(path.len());
        for segment in path.split('/') {
            if segment.is_empty() {
                continue;
            }
            out.push('/');
            out.push_str(self.generalize_segment(segment));
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    fn generalize_segment<'a>(&self, segment: &'a str) -> &'a str {
        if NUMERIC_RE.is_match(segment) || UUID_RE.is_match(segment) {
            return "{id}";
        }
        if HEX_RE.is_match(segment) {
            return "{hash}";
        }
        if segment.len() >= ENTROPY_MIN_LEN && shannon_entropy(segment) > self.entropy_threshold {
            return "{id}";
        }
        segment
    }

    /// How many hits this family has seen so far.
    pub fn count(&self, key: &str) -> u64 {
        self.families.get(key).map(|r| r.count).unwrap_or(0)
    }

    /// Quota decision for a candidate. Does not mutate: the caller commits
    /// with `commit_save` after the artifact lands on disk, or `commit_skip`
    /// when it declines to save, so a failed write leaves no trace.
    pub fn admit(&self, key: &str, candidate: &SampleStats) -> FamilyVerdict {
        let Some(record) = self.families.get(key) else {
            return FamilyVerdict::Save;
        };
        if record.samples_saved < self.max_samples {
            return FamilyVerdict::Save;
        }
        match record.first_sample {
            Some(first) if is_outlier(&first, candidate) => FamilyVerdict::Save,
            _ => FamilyVerdict::Saturated,
        }
    }

    pub fn commit_save(&mut self, key: &str, stats: SampleStats) {
        let record = self.families.entry(key.to_string()).or_default();
        record.count += 1;
        record.samples_saved += 1;
        record.first_sample.get_or_insert(stats);
    }

    pub fn commit_skip(&mut self, key: &str) {
        let record = self.families.entry(key.to_string()).or_default();
        record.count += 1;
        record.skipped += 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FamilyRecord)> {
        self.families.iter()
    }

    /// Rebuild counters from a prior run's manifest. Sample shape stats are
    /// not persisted, so a restored saturated family holds its quota until
    /// a status change lands a fresh sample.
    pub fn seed(&mut self, key: &str, count: u64, samples_saved: u32, skipped: u64) {
        self.families.insert(
            key.to_string(),
            FamilyRecord {
                count,
                samples_saved,
                skipped,
                first_sample: None,
            },
        );
    }
}

/// A saturated family still saves a candidate that looks structurally
/// different from its first sample: title length off by more than 30%,
/// body length off by more than 50%, or a different response status.
fn is_outlier(first: &SampleStats, candidate: &SampleStats) -> bool {
    if candidate.status != first.status {
        return true;
    }
    if deviation(first.title_len, candidate.title_len) > 0.30 {
        return true;
    }
    deviation(first.body_len, candidate.body_len) > 0.50
}

fn deviation(reference: usize, candidate: usize) -> f64 {
    let reference = reference.max(1) as f64;
    (candidate as f64 - reference).abs() / reference
}

/// Sorted parameter names, with `{id}` placeholders for identifier-valued
/// ones: `a=1&id=42&b=x` → `a&b&id={id}`.
fn query_shape(query: &str) -> String {
    let mut names: Vec<String> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(key, _)| {
            if ID_PARAMS.contains(&key.to_lowercase().as_str()) {
                format!("{key}={{id}}")
            } else {
                key.into_owned()
            }
        })
        .collect();
    names.sort();
    names.dedup();
    names.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::Canonicalizer;

    fn registry() -> FamilyRegistry {
        FamilyRegistry::new(3, 3.5)
    }

    fn url(raw: &str) -> CanonicalUrl {
        Canonicalizer::new(&[], true).canonicalize(raw, None).unwrap()
    }

    fn stats(body_len: usize) -> SampleStats {
        SampleStats {
            title_len: 20,
            body_len,
            status: 200,
        }
    }

    #[test]
    fn numeric_segments_generalize_to_id() {
        let r = registry();
        assert_eq!(
            r.key_for(&url("https://a.test/store/item/1")),
            r.key_for(&url("https://a.test/store/item/999"))
        );
        assert_eq!(
            r.key_for(&url("https://a.test/store/item/1")),
            "a.test/store/item/{id}"
        );
    }

    #[test]
    fn hex_and_uuid_segments_generalize() {
        let r = registry();
        assert_eq!(
            r.key_for(&url("https://a.test/build/d41d8cd98f00b204")),
            "a.test/build/{hash}"
        );
        assert_eq!(
            r.key_for(&url(
                "https://a.test/u/123e4567-e89b-12d3-a456-426614174000"
            )),
            "a.test/u/{id}"
        );
    }

    #[test]
    fn high_entropy_slug_generalizes() {
        let r = registry();
        assert_eq!(
            r.key_for(&url("https://a.test/t/xK9mQz2pLw8vBn4c")),
            "a.test/t/{id}"
        );
        // Ordinary words stay as-is.
        assert_eq!(
            r.key_for(&url("https://a.test/t/introduction")),
            "a.test/t/introduction"
        );
    }

    #[test]
    fn query_shape_collapses_id_params() {
        let r = registry();
        assert_eq!(
            r.key_for(&url("https://a.test/p?id=42&tab=specs")),
            r.key_for(&url("https://a.test/p?id=777&tab=specs"))
        );
        assert_eq!(
            r.key_for(&url("https://a.test/p?id=42&tab=specs")),
            "a.test/p?id={id}&tab"
        );
    }

    #[test]
    fn quota_saves_first_n_then_skips() {
        let mut r = registry();
        let key = "a.test/store/item/{id}".to_string();
        for i in 0..3 {
            assert_eq!(r.admit(&key, &stats(1000)), FamilyVerdict::Save, "sample {i}");
            r.commit_save(&key, stats(1000));
        }
        assert_eq!(r.admit(&key, &stats(1010)), FamilyVerdict::Saturated);
        r.commit_skip(&key);

        let record = r.families.get(&key).unwrap();
        assert_eq!(record.count, 4);
        assert_eq!(record.samples_saved, 3);
        assert_eq!(record.skipped, 1);
    }

    #[test]
    fn outlier_breaks_through_saturation() {
        let mut r = registry();
        let key = "a.test/store/item/{id}".to_string();
        for _ in 0..3 {
            r.commit_save(&key, stats(1000));
        }
        // Body length more than 50% off the first sample.
        assert_eq!(r.admit(&key, &stats(2000)), FamilyVerdict::Save);
        // Different status.
        let mut errored = stats(1000);
        errored.status = 500;
        assert_eq!(r.admit(&key, &errored), FamilyVerdict::Save);
        // Title length more than 30% off.
        let mut long_title = stats(1000);
        long_title.title_len = 40;
        assert_eq!(r.admit(&key, &long_title), FamilyVerdict::Save);
    }

    #[test]
    fn failed_write_leaves_no_trace() {
        let mut r = registry();
        let key = "a.test/x".to_string();
        assert_eq!(r.admit(&key, &stats(10)), FamilyVerdict::Save);
        // No commit: the registry must not remember the attempt.
        assert_eq!(r.count(&key), 0);
        r.commit_save(&key, stats(10));
        assert_eq!(r.count(&key), 1);
    }
}
