//! Exact and near-duplicate detection: URL seen-set, content hashes, and a
//! SimHash registry for HTML bodies.

use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// HTTP validators remembered per url_key for API change detection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Owned by the orchestrator; processors and the scheduler read and mutate
/// it only through that single thread.
pub struct DedupIndex {
    seen_urls: HashSet<String>,
    seen_content: HashSet<String>,
    html_fingerprints: Vec<(u64, String)>,
    validators: HashMap<String, Validators>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self {
            seen_urls: HashSet::new(),
            seen_content: HashSet::new(),
            html_fingerprints: Vec::new(),
            validators: HashMap::new(),
        }
    }

    pub fn seen_url(&self, url_key: &str) -> bool {
        self.seen_urls.contains(url_key)
    }

    pub fn mark_url(&mut self, url_key: &str) -> bool {
        self.seen_urls.insert(url_key.to_string())
    }

    pub fn seen_content(&self, sha256: &str) -> bool {
        self.seen_content.contains(sha256)
    }

    pub fn mark_content(&mut self, sha256: &str) -> bool {
        self.seen_content.insert(sha256.to_string())
    }

    /// Highest similarity against the stored HTML fingerprints, with the URL
    /// that produced it.
    pub fn nearest_html(&self, fingerprint: u64) -> Option<(f64, &str)> {
        self.html_fingerprints
            .iter()
            .map(|(stored, url)| (hamming_similarity(*stored, fingerprint), url.as_str()))
            .max_by(|a, b| a.0.total_cmp(&b.0))
    }

    pub fn near_duplicate_html(&self, fingerprint: u64, threshold: f64) -> Option<(f64, &str)> {
        self.nearest_html(fingerprint)
            .filter(|(similarity, _)| *similarity > threshold)
    }

    pub fn register_html_fingerprint(&mut self, fingerprint: u64, source_url: &str) {
        self.html_fingerprints
            .push((fingerprint, source_url.to_string()));
    }

    pub fn validators_match(&self, url_key: &str, candidate: &Validators) -> bool {
        if candidate.is_empty() {
            return false;
        }
        match self.validators.get(url_key) {
            Some(prior) => {
                let etag_match = prior.etag.is_some() && prior.etag == candidate.etag;
                let modified_match =
                    prior.last_modified.is_some() && prior.last_modified == candidate.last_modified;
                etag_match || modified_match
            }
            None => false,
        }
    }

    pub fn record_validators(&mut self, url_key: &str, validators: Validators) {
        if !validators.is_empty() {
            self.validators.insert(url_key.to_string(), validators);
        }
    }

    pub fn url_count(&self) -> usize {
        self.seen_urls.len()
    }

    pub fn content_count(&self) -> usize {
        self.seen_content.len()
    }
}

impl Default for DedupIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Hex-encoded sha256 of a body; the key for exact content dedup.
pub fn content_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Normalized 64-bit Hamming similarity: `1 - popcount(a ^ b) / 64`.
pub fn hamming_similarity(a: u64, b: u64) -> f64 {
    1.0 - ((a ^ b).count_ones() as f64) / 64.0
}

/// 64-bit SimHash over overlapping character shingles of the lowercased,
/// whitespace-collapsed text.
pub fn simhash(text: &str, shingle_size: usize) -> u64 {
    let normalized = collapse_whitespace(&text.to_lowercase());
    let chars: Vec<char> = normalized.chars().collect();
    let k = shingle_size.max(1);

    let mut weights = [0i64; 64];
    if chars.len() < k {
        accumulate_shingle(&normalized, &mut weights);
    } else {
        for window in chars.windows(k) {
            let shingle: String = window.iter().collect();
            accumulate_shingle(&shingle, &mut weights);
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

fn accumulate_shingle(shingle: &str, weights: &mut [i64; 64]) {
    let digest = Sha1::digest(shingle.as_bytes());
    // First 8 digest bytes sliced bit-by-bit into the 64 weight slots.
    for (byte_idx, byte) in digest[..8].iter().enumerate() {
        for bit in 0..8 {
            let slot = byte_idx * 8 + bit;
            if byte >> bit & 1 == 1 {
                weights[slot] += 1;
            } else {
                weights[slot] -= 1;
            }
        }
    }
}

fn collapse_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_space && !out.is_empty() {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_sha256() {
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn identical_text_has_identical_simhash() {
        let a = simhash("The quick brown fox jumps over the lazy dog", 8);
        let b = simhash("the  quick brown FOX jumps over the lazy dog", 8);
        assert_eq!(a, b);
    }

    #[test]
    fn similar_text_scores_high_dissimilar_low() {
        let base = "Welcome to the product catalog page with many listed items and features";
        let near = "Welcome to the product catalog page with many listed items and reviews";
        let far = "404 not found - the page you requested does not exist on this server";

        let f_base = simhash(base, 8);
        let f_near = simhash(near, 8);
        let f_far = simhash(far, 8);

        assert!(hamming_similarity(f_base, f_near) > hamming_similarity(f_base, f_far));
        assert!(hamming_similarity(f_base, f_near) > 0.7);
    }

    #[test]
    fn near_duplicate_respects_threshold() {
        let mut index = DedupIndex::new();
        let fp = simhash("a page body with stable content", 8);
        index.register_html_fingerprint(fp, "https://a.test/one");

        assert!(index.near_duplicate_html(fp, 0.92).is_some());
        let unrelated = simhash("completely different material about other topics", 8);
        assert!(index.near_duplicate_html(unrelated, 0.92).is_none());
    }

    #[test]
    fn url_and_content_sets_are_exact() {
        let mut index = DedupIndex::new();
        assert!(!index.seen_url("k1"));
        assert!(index.mark_url("k1"));
        assert!(!index.mark_url("k1"));
        assert!(index.seen_url("k1"));

        let hash = content_hash(b"body");
        assert!(index.mark_content(&hash));
        assert!(index.seen_content(&hash));
    }

    #[test]
    fn validators_match_on_either_header() {
        let mut index = DedupIndex::new();
        index.record_validators(
            "k1",
            Validators {
                etag: Some("abc".into()),
                last_modified: None,
            },
        );

        assert!(index.validators_match(
            "k1",
            &Validators {
                etag: Some("abc".into()),
                last_modified: None,
            }
        ));
        assert!(!index.validators_match(
            "k1",
            &Validators {
                etag: Some("other".into()),
                last_modified: None,
            }
        ));
        assert!(!index.validators_match("k1", &Validators::default()));
    }
}
