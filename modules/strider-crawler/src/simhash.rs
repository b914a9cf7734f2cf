//! 64-bit SimHash over shingled page text, used for near-duplicate HTML
//! detection and the pagination content diff.

use std::collections::HashSet;

/// Lowercase and collapse all whitespace runs to single spaces.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
}

/// Overlapping character k-gram shingles of normalized text, each hashed to
/// a u64 (first 8 bytes of its sha1, big-endian). The same hashes feed both
/// the SimHash bit vector and the Jaccard diff.
pub fn shingle_hashes(text: &str, k: usize) -> HashSet<u64> {
    let normalized = normalize_text(text);
    let chars: Vec<char> = normalized.chars().collect();
    let mut hashes = HashSet::new();

    if chars.is_empty() || k == 0 {
        return hashes;
    }
    if chars.len() <= k {
        hashes.insert(hash_shingle(&normalized));
        return hashes;
    }
    for window in chars.windows(k) {
        let shingle: String = window.iter().collect();
        hashes.insert(hash_shingle(&shingle));
    }
    hashes
}

fn hash_shingle(shingle: &str) -> u64 {
    use sha1::{Digest, Sha1};
    let digest = Sha1::digest(shingle.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("sha1 is at least 8 bytes"))
}

/// SimHash fingerprint: signed per-bit weights over all shingle hashes,
/// final bit i set iff the weight is positive. Empty text maps to 0.
pub fn simhash(text: &str, shingle_size: usize) -> u64 {
    let hashes = shingle_hashes(text, shingle_size);
    if hashes.is_empty() {
        return 0;
    }

    let mut weights = [0i64; 64];
    for hash in &hashes {
        for (i, weight) in weights.iter_mut().enumerate() {
            if hash >> i & 1 == 1 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }

    let mut fingerprint = 0u64;
    for (i, weight) in weights.iter().enumerate() {
        if *weight > 0 {
            fingerprint |= 1u64 << i;
        }
    }
    fingerprint
}

/// Normalized Hamming similarity: 1 − popcount(a ⊕ b) / 64.
pub fn similarity(a: u64, b: u64) -> f64 {
    1.0 - (a ^ b).count_ones() as f64 / 64.0
}

/// Jaccard similarity of two shingle sets. Empty-vs-empty counts as equal.
pub fn jaccard(a: &HashSet<u64>, b: &HashSet<u64>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOREM: &str = "Pricing plans for teams of every size. Start free, \
        upgrade when you grow. Annual billing saves twenty percent across \
        all tiers and includes priority support with a dedicated channel.";

    #[test]
    fn identical_text_identical_fingerprint() {
        assert_eq!(simhash(LOREM, 8), simhash(LOREM, 8));
    }

    #[test]
    fn case_and_whitespace_do_not_matter() {
        let shouted = LOREM.to_uppercase().replace(' ', "  \n ");
        assert_eq!(simhash(LOREM, 8), simhash(&shouted, 8));
    }

    #[test]
    fn small_edit_stays_similar() {
        let edited = LOREM.replace("twenty", "thirty");
        let sim = similarity(simhash(LOREM, 8), simhash(&edited, 8));
        assert!(sim > 0.85, "small edit should stay similar: {sim}");
    }

    #[test]
    fn unrelated_text_is_distant() {
        let other = "404 not found. The requested resource does not exist \
            on this server. Check the address and try again later or go home.";
        let sim = similarity(simhash(LOREM, 8), simhash(other, 8));
        assert!(sim < 0.85, "unrelated text should differ: {sim}");
    }

    #[test]
    fn empty_text_hashes_to_zero() {
        assert_eq!(simhash("", 8), 0);
        assert_eq!(simhash("   \n\t ", 8), 0);
    }

    #[test]
    fn similarity_bounds() {
        assert!((similarity(0, 0) - 1.0).abs() < f64::EPSILON);
        assert!((similarity(0, u64::MAX) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn short_text_still_produces_a_shingle() {
        let hashes = shingle_hashes("abc", 8);
        assert_eq!(hashes.len(), 1);
    }

    #[test]
    fn jaccard_of_disjoint_sets_is_zero() {
        let a: HashSet<u64> = [1, 2, 3].into_iter().collect();
        let b: HashSet<u64> = [4, 5, 6].into_iter().collect();
        assert!((jaccard(&a, &b)).abs() < f64::EPSILON);
        assert!((jaccard(&a, &a) - 1.0).abs() < f64::EPSILON);
    }
}
