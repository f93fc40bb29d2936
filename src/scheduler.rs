//! Priority scheduler: score-ordered queue with FIFO ties, stop conditions,
//! and a serializable snapshot for checkpointing.

use crate::canonical::UrlRecord;
use crate::dedup::DedupIndex;
use crate::family::FamilyTracker;
use crate::metrics::RunMetrics;
use crate::scope::ScopeGuard;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Instant;

/// Path markers that raise a URL's priority.
const HIGH_VALUE_MARKERS: &[&str] = &[
    "/api", "/graphql", "/auth", "/admin", "/config", "/v1", "/v2",
];

/// Query keys that suggest tracking noise or unpaged cursors.
const NOISE_QUERY_KEYS: &[&str] = &["utm_", "gclid", "fbclid", "session", "cursor", "offset"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkMeta {
    pub depth: u32,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub url_key: String,
    pub url: String,
    pub meta: WorkMeta,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    /// Bypass scope/visited/pending rejection. Used for seeds and restores.
    pub force: bool,
    /// Reuse this score instead of computing one (checkpoint restore).
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueResult {
    Queued(f64),
    OutOfScope,
    AlreadyVisited,
    AlreadyPending,
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
pub struct ScoreWeights {
    pub w_type: f64,
    pub w_depth: f64,
    pub w_novelty: f64,
    pub w_family: f64,
    pub w_noise: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            w_type: 0.35,
            w_depth: 0.35,
            w_novelty: 0.2,
            w_family: 0.3,
            w_noise: 0.15,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StopLimits {
    pub pages_max: u64,
    pub js_max: u64,
    pub api_max: u64,
    pub time_max_secs: Option<u64>,
    pub error_rate_max: f64,
}

/// Serializable view of the queue used by the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerSnapshot {
    pub pending: Vec<WorkItem>,
}

struct ScoredEntry {
    item: WorkItem,
    seq: u64,
}

impl PartialEq for ScoredEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredEntry {}

impl PartialOrd for ScoredEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on score; FIFO (lower seq first) within equal scores.
        self.item
            .score
            .total_cmp(&other.item.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct Scheduler {
    heap: BinaryHeap<ScoredEntry>,
    pending: HashSet<String>,
    seq: u64,
    weights: ScoreWeights,
    limits: StopLimits,
    started_at: Instant,
    seen_hosts: HashSet<String>,
    seen_first_segments: HashSet<String>,
    pub processed: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl Scheduler {
    pub fn new(weights: ScoreWeights, limits: StopLimits) -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashSet::new(),
            seq: 0,
            weights,
            limits,
            started_at: Instant::now(),
            seen_hosts: HashSet::new(),
            seen_first_segments: HashSet::new(),
            processed: 0,
            skipped: 0,
            failed: 0,
        }
    }

    /// Insert a canonicalized URL. Rejection order: scope, visited, pending.
    /// `force` bypasses all three (seeds and checkpoint restore, which were
    /// validated when first enqueued).
    pub fn enqueue(
        &mut self,
        record: &UrlRecord,
        meta: WorkMeta,
        options: EnqueueOptions,
        scope: &ScopeGuard,
        dedup: &DedupIndex,
        families: &FamilyTracker,
    ) -> EnqueueResult {
        if !options.force {
            if !scope.allows(record) {
                return EnqueueResult::OutOfScope;
            }
            if dedup.seen_url(&record.url_key) {
                return EnqueueResult::AlreadyVisited;
            }
            if self.pending.contains(&record.url_key) {
                return EnqueueResult::AlreadyPending;
            }
        } else if self.pending.contains(&record.url_key) {
            return EnqueueResult::AlreadyPending;
        }

        let score = options
            .score
            .unwrap_or_else(|| self.score(record, meta.depth, families));
        self.note_novelty(record);

        self.pending.insert(record.url_key.clone());
        let item = WorkItem {
            url_key: record.url_key.clone(),
            url: record.canonical.clone(),
            meta,
            score,
        };
        self.heap.push(ScoredEntry {
            item,
            seq: self.seq,
        });
        self.seq += 1;
        EnqueueResult::Queued(score)
    }

    pub fn dequeue(&mut self) -> Option<WorkItem> {
        let entry = self.heap.pop()?;
        self.pending.remove(&entry.item.url_key);
        Some(entry.item)
    }

    pub fn mark_processed(&mut self, _item: &WorkItem) {
        self.processed += 1;
    }

    pub fn mark_skipped(&mut self, _item: &WorkItem, _reason: &str) {
        self.skipped += 1;
    }

    pub fn mark_failed(&mut self, _item: &WorkItem) {
        self.failed += 1;
    }

    pub fn pending_len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_pending(&self, url_key: &str) -> bool {
        self.pending.contains(url_key)
    }

    /// First matching stop condition, if any.
    pub fn should_stop(&self, metrics: &RunMetrics) -> Option<StopReason> {
        if metrics.budget.pages >= self.limits.pages_max {
            return Some(StopReason::PagesBudget);
        }
        if metrics.budget.js >= self.limits.js_max {
            return Some(StopReason::JsBudget);
        }
        if metrics.budget.api >= self.limits.api_max {
            return Some(StopReason::ApiBudget);
        }
        if let Some(max_secs) = self.limits.time_max_secs {
            if self.started_at.elapsed().as_secs() >= max_secs {
                return Some(StopReason::TimeLimit);
            }
        }
        if metrics.error_rate() >= self.limits.error_rate_max {
            return Some(StopReason::ErrorRate);
        }
        None
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let mut pending: Vec<WorkItem> = self.heap.iter().map(|e| e.item.clone()).collect();
        pending.sort_by(|a, b| b.score.total_cmp(&a.score));
        SchedulerSnapshot { pending }
    }

    /// Re-enqueue a snapshot with force, preserving recorded scores.
    pub fn restore(
        &mut self,
        snapshot: SchedulerSnapshot,
        scope: &ScopeGuard,
        dedup: &DedupIndex,
        families: &FamilyTracker,
        rules: &crate::canonical::CanonicalRules,
    ) -> usize {
        let mut restored = 0;
        for item in snapshot.pending {
            let record = match crate::canonical::canonicalize(&item.url, None, rules) {
                Ok(rec) => rec,
                Err(_) => continue,
            };
            // The seen-set rebuilt from the manifest still applies.
            if dedup.seen_url(&record.url_key) {
                continue;
            }
            let result = self.enqueue(
                &record,
                item.meta,
                EnqueueOptions {
                    force: true,
                    score: Some(item.score),
                },
                scope,
                dedup,
                families,
            );
            if matches!(result, EnqueueResult::Queued(_)) {
                restored += 1;
            }
        }
        restored
    }

    fn note_novelty(&mut self, record: &UrlRecord) {
        self.seen_hosts.insert(record.host.clone());
        if let Some(first) = first_segment(&record.path) {
            self.seen_first_segments
                .insert(format!("{}{}", record.host, first));
        }
    }

    /// Clipped weighted sum per the scoring policy; clamped to [0, 1].
    fn score(&self, record: &UrlRecord, depth: u32, families: &FamilyTracker) -> f64 {
        let w = &self.weights;
        let mut score = 0.0;

        let path_lower = record.path.to_ascii_lowercase();
        if HIGH_VALUE_MARKERS.iter().any(|m| path_lower.contains(m)) {
            score += w.w_type;
        }

        score += w.w_depth * (1.0 / (1.0 + depth as f64));

        let novel_host = !self.seen_hosts.contains(&record.host);
        let novel_segment = match first_segment(&record.path) {
            Some(first) => !self
                .seen_first_segments
                .contains(&format!("{}{}", record.host, first)),
            None => false,
        };
        if novel_host || novel_segment {
            score += w.w_novelty;
        }

        let family_key = families.family_key(record);
        score -= w.w_family * families.saturation(&family_key);

        if let Some(query) = &record.query {
            let q = query.to_ascii_lowercase();
            if NOISE_QUERY_KEYS.iter().any(|k| q.contains(k)) {
                score -= w.w_noise;
            }
        }

        score.clamp(0.0, 1.0)
    }
}

fn first_segment(path: &str) -> Option<&str> {
    path.split('/').find(|s| !s.is_empty())
}
