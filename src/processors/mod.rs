//! Content processors: reduce a fetched response into an artifact plus
//! discovered work, as a plain result record the orchestrator applies.

pub mod api;
pub mod html;
pub mod js;

use crate::config::Heuristics;
use crate::dedup::DedupIndex;
use crate::family::FamilyTracker;
use crate::manifest::{ArtifactRecord, CodexEntry, EndpointRecord};
use crate::storage::Storage;

pub use api::ApiProcessor;
pub use html::HtmlProcessor;
pub use js::JsProcessor;

/// Mutable slices of crawl state a processor is allowed to touch.
pub struct ProcessContext<'a> {
    pub dedup: &'a mut DedupIndex,
    pub families: &'a mut FamilyTracker,
    pub storage: &'a Storage,
    pub heuristics: &'a Heuristics,
}

/// A URL surfaced during processing, not yet canonicalized or scoped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub url: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Saved,
    Duplicate,
    FamilySkipped,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Saved => "saved",
            ProcessStatus::Duplicate => "duplicate",
            ProcessStatus::FamilySkipped => "family-skipped",
        }
    }
}

/// What one processing pass produced. The orchestrator registers the
/// artifact, enqueues the discovered URLs, and records the endpoints; the
/// processor never reaches back into the scheduler.
#[derive(Debug)]
pub struct ProcessOutcome {
    pub status: ProcessStatus,
    pub artifact: Option<(ArtifactRecord, CodexEntry)>,
    pub discovered: Vec<Discovered>,
    pub endpoints: Vec<EndpointRecord>,
    pub redacted: bool,
}

impl ProcessOutcome {
    pub fn skipped(status: ProcessStatus) -> Self {
        Self {
            status,
            artifact: None,
            discovered: Vec::new(),
            endpoints: Vec::new(),
            redacted: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("parse failure: {0}")]
    Parse(String),

    #[error("artifact write failed: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
