//! Manifest assembly and the streaming codex index.
//!
//! Artifact records accumulate in memory and flush to `manifest.json`
//! periodically; codex entries stream line-by-line to `codex_index.jsonl`
//! the moment an artifact registers.

use crate::family::FamilyRecord;
use crate::metrics::BudgetCounters;
use crate::storage::write_atomic_at;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const CODEX_FILE: &str = "codex_index.jsonl";

const FLUSH_EVERY_ARTIFACTS: usize = 50;
const FLUSH_EVERY_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub kind: String,
    pub url: String,
    pub path: String,
    pub sha256: String,
    pub size: usize,
    pub status: u16,
    pub depth: u32,
    pub captured_at: u64,
    #[serde(default)]
    pub redacted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexEntry {
    pub path: String,
    pub kind: String,
    pub sha256: String,
    pub url: String,
    pub priority: f64,
    pub hints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointRecord {
    pub url: String,
    pub source: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMeta {
    pub target: String,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    pub config_hash: String,
    pub depth_max: u32,
    pub budgets_used: BudgetCounters,
    pub budgets_max: BudgetCounters,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestDocument {
    metadata: ManifestMeta,
    files: Vec<ArtifactRecord>,
    patterns: HashMap<String, FamilyRecord>,
    endpoints: Vec<EndpointRecord>,
    errors: Vec<ErrorTally>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorTally {
    kind: String,
    count: u64,
}

pub struct ManifestSink {
    manifest_path: PathBuf,
    meta: ManifestMeta,
    files: Vec<ArtifactRecord>,
    endpoints: Vec<EndpointRecord>,
    codex: std::fs::File,
    pending_since_flush: usize,
    last_flush: Instant,
}

impl ManifestSink {
    pub fn new(root: &Path, meta: ManifestMeta) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let codex = OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join(CODEX_FILE))?;

        Ok(Self {
            manifest_path: root.join(MANIFEST_FILE),
            meta,
            files: Vec::new(),
            endpoints: Vec::new(),
            codex,
            pending_since_flush: 0,
            last_flush: Instant::now(),
        })
    }

    /// Append an artifact and stream its codex line immediately.
    pub fn register_artifact(
        &mut self,
        record: ArtifactRecord,
        codex: CodexEntry,
    ) -> std::io::Result<()> {
        let line = serde_json::to_string(&codex)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(self.codex, "{}", line)?;
        self.codex.flush()?;

        tracing::info!(
            event = "artifact",
            kind = %record.kind,
            path = %record.path,
            sha256 = %record.sha256,
            "artifact registered"
        );

        self.files.push(record);
        self.pending_since_flush += 1;
        Ok(())
    }

    pub fn record_endpoint(&mut self, endpoint: EndpointRecord) {
        if !self.endpoints.iter().any(|e| e.url == endpoint.url) {
            self.endpoints.push(endpoint);
        }
    }

    pub fn endpoints(&self) -> &[EndpointRecord] {
        &self.endpoints
    }

    pub fn files(&self) -> &[ArtifactRecord] {
        &self.files
    }

    /// Seed the in-memory file list from a prior run so resumed flushes
    /// keep the full artifact history.
    pub fn preload(&mut self, files: Vec<ArtifactRecord>) {
        self.files = files;
    }

    pub fn update_budgets(&mut self, used: BudgetCounters) {
        self.meta.budgets_used = used;
    }

    pub fn mark_finished(&mut self, finished_at: u64) {
        self.meta.finished_at = Some(finished_at);
    }

    /// Flush when 50 artifacts accumulated or 60 seconds elapsed since the
    /// last flush; `force` always flushes (terminal events).
    pub fn maybe_flush(
        &mut self,
        force: bool,
        patterns: &HashMap<String, FamilyRecord>,
        errors: &HashMap<String, u64>,
    ) -> std::io::Result<bool> {
        let due = self.pending_since_flush >= FLUSH_EVERY_ARTIFACTS
            || self.last_flush.elapsed().as_secs() >= FLUSH_EVERY_SECS;
        if !force && !due {
            return Ok(false);
        }
        if !force && self.pending_since_flush == 0 {
            // Nothing new; just reset the timer.
            self.last_flush = Instant::now();
            return Ok(false);
        }

        let mut tallies: Vec<ErrorTally> = errors
            .iter()
            .map(|(kind, count)| ErrorTally {
                kind: kind.clone(),
                count: *count,
            })
            .collect();
        tallies.sort_by(|a, b| a.kind.cmp(&b.kind));

        let document = ManifestDocument {
            metadata: self.meta.clone(),
            files: self.files.clone(),
            patterns: patterns.clone(),
            endpoints: self.endpoints.clone(),
            errors: tallies,
        };

        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write_atomic_at(&self.manifest_path, &bytes)?;

        tracing::info!(
            event = "flush",
            files = self.files.len(),
            "manifest flushed"
        );
        self.pending_since_flush = 0;
        self.last_flush = Instant::now();
        Ok(true)
    }

    /// Artifact records from a prior run's manifest, used to rebuild the
    /// seen-sets on resume. Absent or unreadable manifests yield an empty
    /// list.
    pub fn load_prior_artifacts(root: &Path) -> Vec<ArtifactRecord> {
        let path = root.join(MANIFEST_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str::<ManifestDocument>(&raw) {
            Ok(doc) => doc.files,
            Err(e) => {
                tracing::warn!(error = %e, "could not parse prior manifest, starting fresh");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta() -> ManifestMeta {
        ManifestMeta {
            target: "https://a.test".to_string(),
            started_at: 1_700_000_000,
            finished_at: None,
            config_hash: "cafe0123".to_string(),
            depth_max: 3,
            budgets_used: BudgetCounters::default(),
            budgets_max: BudgetCounters {
                pages: 10,
                js: 10,
                api: 10,
            },
        }
    }

    fn artifact(sha: &str) -> ArtifactRecord {
        ArtifactRecord {
            kind: "html".to_string(),
            url: "https://a.test/p".to_string(),
            path: "pages/p.html".to_string(),
            sha256: sha.to_string(),
            size: 10,
            status: 200,
            depth: 1,
            captured_at: 1_700_000_001,
            redacted: false,
        }
    }

    fn codex(sha: &str) -> CodexEntry {
        CodexEntry {
            path: "pages/p.html".to_string(),
            kind: "html".to_string(),
            sha256: sha.to_string(),
            url: "https://a.test/p".to_string(),
            priority: 0.5,
            hints: vec![],
        }
    }

    #[test]
    fn codex_lines_stream_immediately() {
        let dir = TempDir::new().unwrap();
        let mut sink = ManifestSink::new(dir.path(), meta()).unwrap();
        sink.register_artifact(artifact("aa"), codex("aa")).unwrap();
        sink.register_artifact(artifact("bb"), codex("bb")).unwrap();

        let codex_raw = std::fs::read_to_string(dir.path().join(CODEX_FILE)).unwrap();
        let lines: Vec<&str> = codex_raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: CodexEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.sha256, "aa");
    }

    #[test]
    fn forced_flush_writes_manifest() {
        let dir = TempDir::new().unwrap();
        let mut sink = ManifestSink::new(dir.path(), meta()).unwrap();
        sink.register_artifact(artifact("aa"), codex("aa")).unwrap();

        let flushed = sink.maybe_flush(true, &HashMap::new(), &HashMap::new()).unwrap();
        assert!(flushed);

        let files = ManifestSink::load_prior_artifacts(dir.path());
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].sha256, "aa");
    }

    #[test]
    fn unforced_flush_waits_for_threshold() {
        let dir = TempDir::new().unwrap();
        let mut sink = ManifestSink::new(dir.path(), meta()).unwrap();
        sink.register_artifact(artifact("aa"), codex("aa")).unwrap();
        let flushed = sink.maybe_flush(false, &HashMap::new(), &HashMap::new()).unwrap();
        assert!(!flushed);

        for i in 0..FLUSH_EVERY_ARTIFACTS {
            let sha = format!("sha{}", i);
            sink.register_artifact(artifact(&sha), codex(&sha)).unwrap();
        }
        let flushed = sink.maybe_flush(false, &HashMap::new(), &HashMap::new()).unwrap();
        assert!(flushed);
    }

    #[test]
    fn endpoints_deduplicate_by_url() {
        let dir = TempDir::new().unwrap();
        let mut sink = ManifestSink::new(dir.path(), meta()).unwrap();
        let ep = EndpointRecord {
            url: "https://a.test/api/x".to_string(),
            source: "js".to_string(),
            score: 0.7,
        };
        sink.record_endpoint(ep.clone());
        sink.record_endpoint(ep);
        assert_eq!(sink.endpoints().len(), 1);
    }

    #[test]
    fn missing_manifest_loads_empty() {
        let dir = TempDir::new().unwrap();
        assert!(ManifestSink::load_prior_artifacts(dir.path()).is_empty());
    }
}
