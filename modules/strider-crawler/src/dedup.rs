//! Exact and near-duplicate tracking. Owned by the orchestrator; processors
//! receive it as a slice of the crawl context under the single-threaded
//! orchestrator contract, so plain collections suffice.

use std::collections::{HashMap, HashSet};

use crate::canonical::CanonicalUrl;
use crate::simhash;

/// Query parameters that page through a listing without changing its shape.
const PAGINATION_PARAMS: &[&str] = &["page", "offset", "cursor"];

/// For a URL carrying a pagination parameter, the identity it shares with
/// its siblings: the canonical form minus pagination params. None when the
/// URL is not paginated.
pub fn pagination_sibling_key(url: &CanonicalUrl) -> Option<String> {
    let query = url.query.as_deref()?;
    let mut kept: Vec<(String, String)> = Vec::new();
    let mut had_pagination = false;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if PAGINATION_PARAMS.contains(&key.to_lowercase().as_str()) {
            had_pagination = true;
        } else {
            kept.push((key.into_owned(), value.into_owned()));
        }
    }
    if !had_pagination {
        return None;
    }

    let mut sibling = format!("{}{}", url.host, url.path);
    if !kept.is_empty() {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        serializer.extend_pairs(kept.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        sibling.push('?');
        sibling.push_str(&serializer.finish());
    }
    Some(sibling)
}

/// Cached HTTP validators for a url_key, used by the API processor to spot
/// unchanged responses without comparing bodies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }

    /// Equal when either validator is present on both sides and matches.
    pub fn matches(&self, other: &Validators) -> bool {
        let etag_match = matches!((&self.etag, &other.etag), (Some(a), Some(b)) if a == b);
        let lm_match = matches!(
            (&self.last_modified, &other.last_modified),
            (Some(a), Some(b)) if a == b
        );
        etag_match || lm_match
    }
}

pub struct DedupIndex {
    seen_urls: HashSet<String>,
    seen_content: HashSet<String>,
    /// (fingerprint, source url) pairs for every saved HTML page.
    html_fingerprints: Vec<(u64, String)>,
    validators: HashMap<String, Validators>,
    /// First saved sibling's shingle set per pagination family.
    pagination_baselines: HashMap<String, HashSet<u64>>,
    /// Sibling keys where a later page diffed enough to be kept too.
    pagination_diffed: HashSet<String>,
    /// One saved copy per fingerprinted JS bundle family.
    js_fingerprint_families: HashSet<String>,
    similarity_drop: f64,
}

impl DedupIndex {
    pub fn new(similarity_drop: f64) -> Self {
        Self {
            seen_urls: HashSet::new(),
            seen_content: HashSet::new(),
            html_fingerprints: Vec::new(),
            validators: HashMap::new(),
            pagination_baselines: HashMap::new(),
            pagination_diffed: HashSet::new(),
            js_fingerprint_families: HashSet::new(),
            similarity_drop,
        }
    }

    // --- url keys ---

    pub fn seen_url(&self, url_key: &str) -> bool {
        self.seen_urls.contains(url_key)
    }

    pub fn mark_url(&mut self, url_key: &str) -> bool {
        self.seen_urls.insert(url_key.to_string())
    }

    // --- content hashes ---

    pub fn seen_content(&self, sha256: &str) -> bool {
        self.seen_content.contains(sha256)
    }

    pub fn mark_content(&mut self, sha256: &str) -> bool {
        self.seen_content.insert(sha256.to_string())
    }

    // --- html near-duplicates ---

    /// The closest stored fingerprint above the drop threshold, if any.
    pub fn near_duplicate_html(&self, fingerprint: u64) -> Option<(f64, &str)> {
        self.html_fingerprints
            .iter()
            .map(|(stored, url)| (simhash::similarity(fingerprint, *stored), url.as_str()))
            .filter(|(sim, _)| *sim > self.similarity_drop)
            .max_by(|a, b| a.0.total_cmp(&b.0))
    }

    pub fn register_html_fingerprint(&mut self, fingerprint: u64, url: &str) {
        self.html_fingerprints.push((fingerprint, url.to_string()));
    }

    // --- validators ---

    pub fn validators_unchanged(&self, url_key: &str, current: &Validators) -> bool {
        if current.is_empty() {
            return false;
        }
        self.validators
            .get(url_key)
            .map(|prior| prior.matches(current))
            .unwrap_or(false)
    }

    pub fn record_validators(&mut self, url_key: &str, validators: Validators) {
        if !validators.is_empty() {
            self.validators.insert(url_key.to_string(), validators);
        }
    }

    // --- pagination baselines ---

    pub fn pagination_baseline(&self, sibling_key: &str) -> Option<&HashSet<u64>> {
        self.pagination_baselines.get(sibling_key)
    }

    /// Has a non-baseline sibling of this group ever been kept? That save
    /// only happens after the content diff passed, so it is the evidence
    /// that further pages of this listing can carry fresh content.
    pub fn pagination_diff_evidence(&self, sibling_key: &str) -> bool {
        self.pagination_diffed.contains(sibling_key)
    }

    /// Record a saved pagination sibling. The first save becomes the
    /// group's baseline; any later save means the diff gate passed and
    /// counts as diff evidence.
    pub fn record_pagination_save(&mut self, sibling_key: &str, shingles: HashSet<u64>) {
        if self.pagination_baselines.contains_key(sibling_key) {
            self.pagination_diffed.insert(sibling_key.to_string());
        } else {
            self.pagination_baselines
                .insert(sibling_key.to_string(), shingles);
        }
    }

    // --- js fingerprint families ---

    pub fn js_family_seen(&self, family: &str) -> bool {
        self.js_fingerprint_families.contains(family)
    }

    pub fn mark_js_family(&mut self, family: &str) -> bool {
        self.js_fingerprint_families.insert(family.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_and_content_sets_are_exact() {
        let mut index = DedupIndex::new(0.92);
        assert!(!index.seen_url("k1"));
        assert!(index.mark_url("k1"));
        assert!(!index.mark_url("k1"));
        assert!(index.seen_url("k1"));

        assert!(index.mark_content("abc"));
        assert!(index.seen_content("abc"));
        assert!(!index.seen_content("def"));
    }

    #[test]
    fn near_duplicate_found_above_threshold() {
        let mut index = DedupIndex::new(0.92);
        let base = 0xFFFF_FFFF_FFFF_FFFFu64;
        index.register_html_fingerprint(base, "https://a.test/one");

        // 2 flipped bits → similarity 62/64 ≈ 0.969
        let close = base ^ 0b11;
        let hit = index.near_duplicate_html(close);
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().1, "https://a.test/one");

        // 16 flipped bits → similarity 0.75
        let far = base ^ 0xFFFF;
        assert!(index.near_duplicate_html(far).is_none());
    }

    #[test]
    fn validators_match_on_either_field() {
        let mut index = DedupIndex::new(0.92);
        index.record_validators(
            "k1",
            Validators {
                etag: Some("\"v1\"".into()),
                last_modified: None,
            },
        );
        assert!(index.validators_unchanged(
            "k1",
            &Validators {
                etag: Some("\"v1\"".into()),
                last_modified: Some("today".into()),
            }
        ));
        assert!(!index.validators_unchanged(
            "k1",
            &Validators {
                etag: Some("\"v2\"".into()),
                last_modified: None,
            }
        ));
        assert!(!index.validators_unchanged("k1", &Validators::default()));
        assert!(!index.validators_unchanged("other", &Validators::default()));
    }

    #[test]
    fn sibling_key_strips_pagination_params_only() {
        let canon = crate::canonical::Canonicalizer::new(&[], true);
        let page2 = canon
            .canonicalize("https://a.test/list?category=news&page=2", None)
            .unwrap();
        let page9 = canon
            .canonicalize("https://a.test/list?category=news&page=9", None)
            .unwrap();
        let unpaged = canon
            .canonicalize("https://a.test/list?category=news", None)
            .unwrap();

        let k2 = pagination_sibling_key(&page2).unwrap();
        let k9 = pagination_sibling_key(&page9).unwrap();
        assert_eq!(k2, k9);
        assert_eq!(k2, "a.test/list?category=news");
        assert!(pagination_sibling_key(&unpaged).is_none());
    }

    #[test]
    fn pagination_baseline_keeps_first_and_later_saves_are_evidence() {
        let mut index = DedupIndex::new(0.92);
        let first: HashSet<u64> = [1, 2].into_iter().collect();
        let second: HashSet<u64> = [9].into_iter().collect();

        index.record_pagination_save("sib", first.clone());
        assert_eq!(index.pagination_baseline("sib"), Some(&first));
        assert!(!index.pagination_diff_evidence("sib"));

        // A second kept sibling passed the diff gate: the baseline stays
        // put and the group now has diff evidence.
        index.record_pagination_save("sib", second);
        assert_eq!(index.pagination_baseline("sib"), Some(&first));
        assert!(index.pagination_diff_evidence("sib"));
        assert!(!index.pagination_diff_evidence("other"));
    }
}
