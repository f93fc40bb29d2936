//! Run counters: per-kind budgets, error tallies, and the sliding window
//! feeding the error-rate stop condition.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

const ERROR_WINDOW: usize = 50;

/// Saved-artifact counters per kind. Monotone non-decreasing for the life of
/// a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BudgetCounters {
    pub pages: u64,
    pub js: u64,
    pub api: u64,
}

impl BudgetCounters {
    pub fn total(&self) -> u64 {
        self.pages + self.js + self.api
    }
}

/// Mutable run statistics owned by the orchestrator.
#[derive(Debug, Default)]
pub struct RunMetrics {
    pub budget: BudgetCounters,
    pub enqueued: u64,
    pub dequeued: u64,
    pub duplicates: u64,
    pub family_skipped: u64,
    pub redacted: u64,
    errors: HashMap<String, u64>,
    recent: VecDeque<bool>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&mut self, kind: &str) {
        *self.errors.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn error_count(&self, kind: &str) -> u64 {
        self.errors.get(kind).copied().unwrap_or(0)
    }

    pub fn errors(&self) -> &HashMap<String, u64> {
        &self.errors
    }

    /// Record one fetch outcome into the sliding window.
    pub fn record_fetch_outcome(&mut self, success: bool) {
        if self.recent.len() == ERROR_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(success);
    }

    /// Failure fraction over the recent window; 0 until enough samples exist
    /// to be meaningful.
    pub fn error_rate(&self) -> f64 {
        if self.recent.len() < 10 {
            return 0.0;
        }
        let failures = self.recent.iter().filter(|ok| !**ok).count();
        failures as f64 / self.recent.len() as f64
    }
}
