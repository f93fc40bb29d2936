//! URL family generalization and per-family sampling quota.
//!
//! Structurally identical endpoints (`/store/item/1`, `/store/item/2`, ...)
//! collapse into one family key so the crawl saves a few representatives and
//! counts the rest.

use crate::canonical::UrlRecord;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const ENTROPY_BITS_THRESHOLD: f64 = 3.5;
const ENTROPY_MIN_LEN: usize = 12;

/// Default title-length deviation past which a saturated family still saves
/// the sample. Overridden by `heuristics.family_threshold`.
const DEFAULT_OUTLIER_THRESHOLD: f64 = 0.30;

/// Body-length deviation bound for the same decision.
const BODY_OUTLIER_DEVIATION: f64 = 0.50;

/// Query parameter names whose values collapse to `{id}`.
const ID_PARAMS: &[&str] = &["id", "item", "ref"];

/// Measurements of a candidate sample used for outlier detection.
#[derive(Debug, Clone, Copy)]
pub struct SampleStats {
    pub title_len: usize,
    pub body_len: usize,
    pub status: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyDecision {
    Save,
    Skip,
}

/// Per-family tally carried into the manifest's `patterns` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyRecord {
    pub count: u64,
    pub samples_saved: u64,
    pub skipped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) first_sample: Option<FirstSample>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct FirstSample {
    title_len: usize,
    body_len: usize,
    status: u16,
}

pub struct FamilyTracker {
    families: HashMap<String, FamilyRecord>,
    max_samples: u64,
    outlier_threshold: f64,
    digits: Regex,
    hex_run: Regex,
    uuid: Regex,
}

impl FamilyTracker {
    pub fn new(max_samples: u64) -> Self {
        Self {
            families: HashMap::new(),
            max_samples,
            outlier_threshold: DEFAULT_OUTLIER_THRESHOLD,
            digits: Regex::new(r"^\d+$").expect("digits pattern"),
            hex_run: Regex::new(r"^[0-9a-f]{8,}$").expect("hex pattern"),
            uuid: Regex::new(
                r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
            )
            .expect("uuid pattern"),
        }
    }

    /// Tune the title-deviation bound used for outlier detection.
    pub fn with_outlier_threshold(mut self, threshold: f64) -> Self {
        self.outlier_threshold = threshold.max(0.0);
        self
    }

    /// Family key = host + generalized path + normalized query shape.
    pub fn family_key(&self, record: &UrlRecord) -> String {
        let generalized: Vec<String> = record
            .path
            .split('/')
            .map(|segment| self.generalize_segment(segment))
            .collect();

        let mut key = format!("{}{}", record.host, generalized.join("/"));
        if let Some(shape) = self.query_shape(record.query.as_deref()) {
            key.push('?');
            key.push_str(&shape);
        }
        key
    }

    fn generalize_segment(&self, segment: &str) -> String {
        if segment.is_empty() {
            return String::new();
        }
        if self.digits.is_match(segment) || self.uuid.is_match(segment) {
            return "{id}".to_string();
        }
        if self.hex_run.is_match(segment) {
            return "{hash}".to_string();
        }
        if segment.len() >= ENTROPY_MIN_LEN && shannon_bits_per_char(segment) > ENTROPY_BITS_THRESHOLD
        {
            return "{id}".to_string();
        }
        segment.to_string()
    }

    fn query_shape(&self, query: Option<&str>) -> Option<String> {
        let query = query?;
        let mut keys: Vec<String> = query
            .split('&')
            .filter(|part| !part.is_empty())
            .map(|part| {
                let key = part.split('=').next().unwrap_or(part);
                let lowered = key.to_ascii_lowercase();
                if ID_PARAMS.contains(&lowered.as_str()) {
                    format!("{}={{id}}", key)
                } else {
                    key.to_string()
                }
            })
            .collect();
        keys.sort();
        Some(keys.join("&"))
    }

    /// Count a hit. Returns the family's hit count after this sighting.
    pub fn observe(&mut self, key: &str) -> u64 {
        let record = self.families.entry(key.to_string()).or_insert(FamilyRecord {
            count: 0,
            samples_saved: 0,
            skipped: 0,
            first_sample: None,
        });
        record.count += 1;
        record.count
    }

    /// Current hit count without mutating.
    pub fn count(&self, key: &str) -> u64 {
        self.families.get(key).map(|r| r.count).unwrap_or(0)
    }

    /// Save the first `max_samples` hits; beyond that only outliers pass.
    pub fn decide(&mut self, key: &str, stats: SampleStats) -> FamilyDecision {
        let max = self.max_samples;
        let record = self.families.entry(key.to_string()).or_insert(FamilyRecord {
            count: 0,
            samples_saved: 0,
            skipped: 0,
            first_sample: None,
        });

        if record.samples_saved < max {
            return FamilyDecision::Save;
        }

        let outlier = match record.first_sample {
            Some(first) => is_outlier(first, stats, self.outlier_threshold),
            None => false,
        };

        if outlier {
            FamilyDecision::Save
        } else {
            record.skipped += 1;
            FamilyDecision::Skip
        }
    }

    /// Record a saved sample, capturing the first sample's shape as the
    /// outlier baseline. The counter never exceeds the quota: outlier saves
    /// past it are real artifacts but do not inflate `samples_saved`.
    pub fn record_saved(&mut self, key: &str, stats: SampleStats) {
        let max = self.max_samples;
        let record = self.families.entry(key.to_string()).or_insert(FamilyRecord {
            count: 0,
            samples_saved: 0,
            skipped: 0,
            first_sample: None,
        });
        if record.samples_saved < max {
            record.samples_saved += 1;
        }
        if record.first_sample.is_none() {
            record.first_sample = Some(FirstSample {
                title_len: stats.title_len,
                body_len: stats.body_len,
                status: stats.status,
            });
        }
    }

    pub fn records(&self) -> &HashMap<String, FamilyRecord> {
        &self.families
    }

    /// Saturation as a fraction of the sample quota, feeding the scheduler's
    /// family penalty term.
    pub fn saturation(&self, key: &str) -> f64 {
        if self.max_samples == 0 {
            return 1.0;
        }
        let count = self.count(key) as f64;
        (count / self.max_samples as f64).min(1.0)
    }
}

fn is_outlier(first: FirstSample, candidate: SampleStats, title_threshold: f64) -> bool {
    if candidate.status != first.status {
        return true;
    }
    if deviation(first.title_len, candidate.title_len) > title_threshold {
        return true;
    }
    deviation(first.body_len, candidate.body_len) > BODY_OUTLIER_DEVIATION
}

fn deviation(baseline: usize, candidate: usize) -> f64 {
    if baseline == 0 {
        return if candidate == 0 { 0.0 } else { 1.0 };
    }
    let diff = baseline.abs_diff(candidate) as f64;
    diff / baseline as f64
}

/// Shannon entropy in bits per character.
fn shannon_bits_per_char(text: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for ch in text.chars() {
        *counts.entry(ch).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    let total_f = total as f64;
    counts
        .values()
        .map(|&c| {
            let p = c as f64 / total_f;
            -p * p.log2()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{canonicalize, CanonicalRules};

    fn record(url: &str) -> UrlRecord {
        canonicalize(url, None, &CanonicalRules::default()).unwrap()
    }

    fn stats(title: usize, body: usize, status: u16) -> SampleStats {
        SampleStats {
            title_len: title,
            body_len: body,
            status,
        }
    }

    #[test]
    fn numeric_segments_become_id() {
        let tracker = FamilyTracker::new(3);
        let key = tracker.family_key(&record("https://a.test/store/item/42"));
        assert_eq!(key, "a.test/store/item/{id}");
    }

    #[test]
    fn hex_and_uuid_segments_generalize() {
        let tracker = FamilyTracker::new(3);
        assert_eq!(
            tracker.family_key(&record("https://a.test/blob/deadbeef01")),
            "a.test/blob/{hash}"
        );
        assert_eq!(
            tracker.family_key(&record(
                "https://a.test/u/123e4567-e89b-12d3-a456-426614174000"
            )),
            "a.test/u/{id}"
        );
    }

    #[test]
    fn high_entropy_slugs_become_id() {
        let tracker = FamilyTracker::new(3);
        let key = tracker.family_key(&record("https://a.test/s/xK9fQ2mW7pL4zR8v"));
        assert_eq!(key, "a.test/s/{id}");
        // A readable slug stays put.
        let key = tracker.family_key(&record("https://a.test/s/about-the-team"));
        assert_eq!(key, "a.test/s/about-the-team");
    }

    #[test]
    fn id_params_collapse_in_query_shape() {
        let tracker = FamilyTracker::new(3);
        let a = tracker.family_key(&record("https://a.test/p?id=1&lang=en"));
        let b = tracker.family_key(&record("https://a.test/p?id=999&lang=en"));
        assert_eq!(a, b);
        assert!(a.contains("id={id}"));
    }

    #[test]
    fn quota_saves_first_n_then_skips() {
        let mut tracker = FamilyTracker::new(3);
        let key = "a.test/store/item/{id}";
        let base = stats(20, 1000, 200);

        for i in 0..1000u64 {
            tracker.observe(key);
            if tracker.decide(key, base) == FamilyDecision::Save {
                tracker.record_saved(key, base);
            }
            let rec = &tracker.records()[key];
            assert!(rec.samples_saved <= 3, "iteration {}", i);
        }

        let rec = &tracker.records()[key];
        assert_eq!(rec.count, 1000);
        assert_eq!(rec.samples_saved, 3);
        assert_eq!(rec.skipped, 997);
    }

    #[test]
    fn outliers_pass_the_saturated_quota() {
        let mut tracker = FamilyTracker::new(1);
        let key = "a.test/p/{id}";
        tracker.observe(key);
        tracker.record_saved(key, stats(20, 1000, 200));

        // Same shape: skipped.
        tracker.observe(key);
        assert_eq!(tracker.decide(key, stats(21, 1010, 200)), FamilyDecision::Skip);

        // Status differs: outlier.
        tracker.observe(key);
        assert_eq!(tracker.decide(key, stats(20, 1000, 404)), FamilyDecision::Save);

        // Body length off by more than half: outlier.
        tracker.observe(key);
        assert_eq!(tracker.decide(key, stats(20, 90, 200)), FamilyDecision::Save);

        // Title length off by more than 30%: outlier.
        tracker.observe(key);
        assert_eq!(tracker.decide(key, stats(40, 1000, 200)), FamilyDecision::Save);
    }

    #[test]
    fn outlier_threshold_is_tunable() {
        let key = "a.test/p/{id}";

        // Default threshold: a 20% title deviation is not an outlier.
        let mut tracker = FamilyTracker::new(1);
        tracker.observe(key);
        tracker.record_saved(key, stats(100, 1000, 200));
        tracker.observe(key);
        assert_eq!(tracker.decide(key, stats(120, 1000, 200)), FamilyDecision::Skip);

        // Tightened threshold: the same deviation now saves.
        let mut tracker = FamilyTracker::new(1).with_outlier_threshold(0.1);
        tracker.observe(key);
        tracker.record_saved(key, stats(100, 1000, 200));
        tracker.observe(key);
        assert_eq!(tracker.decide(key, stats(120, 1000, 200)), FamilyDecision::Save);
    }
}
