//! Run checkpoint: atomic snapshot of the pending queue and budget counters
//! so an interrupted run can continue as the same logical run.

use crate::metrics::BudgetCounters;
use crate::scheduler::SchedulerSnapshot;
use crate::storage::write_atomic_at;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_url: Option<String>,
    pub pending: SchedulerSnapshot,
    pub budget: BudgetCounters,
    pub started_at: u64,
    pub updated_at: u64,
}

pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(CHECKPOINT_FILE),
        }
    }

    /// Overwrite the checkpoint atomically. Either the previous or the new
    /// snapshot is on disk at every instant.
    pub fn save(&self, checkpoint: &Checkpoint) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write_atomic_at(&self.path, &bytes)?;
        tracing::debug!(
            event = "checkpoint",
            pending = checkpoint.pending.pending.len(),
            "checkpoint written"
        );
        Ok(())
    }

    pub fn load(&self) -> Option<Checkpoint> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                tracing::warn!(error = %e, "checkpoint unreadable, ignoring");
                None
            }
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
