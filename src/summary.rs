//! Human-readable run summary written to the output tree on shutdown.

use crate::family::FamilyRecord;
use crate::manifest::ArtifactRecord;
use crate::metrics::RunMetrics;
use crate::storage::write_atomic_at;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

pub const INDEX_FILE: &str = "INDEX.md";

pub fn write_index(
    root: &Path,
    end_reason: &str,
    metrics: &RunMetrics,
    files: &[ArtifactRecord],
    families: &HashMap<String, FamilyRecord>,
    endpoint_count: usize,
) -> std::io::Result<()> {
    let mut out = String::new();

    let _ = writeln!(out, "# Crawl summary\n");
    let _ = writeln!(out, "- End reason: `{}`", end_reason);
    let _ = writeln!(
        out,
        "- Artifacts: {} total ({} pages, {} js, {} api)",
        files.len(),
        metrics.budget.pages,
        metrics.budget.js,
        metrics.budget.api
    );
    let _ = writeln!(
        out,
        "- Queue: {} enqueued, {} dequeued, {} duplicates, {} family-skipped",
        metrics.enqueued, metrics.dequeued, metrics.duplicates, metrics.family_skipped
    );
    let _ = writeln!(out, "- Endpoints discovered: {}", endpoint_count);
    let _ = writeln!(out, "- Responses redacted: {}", metrics.redacted);

    if !families.is_empty() {
        let _ = writeln!(out, "\n## Top URL families\n");
        let _ = writeln!(out, "| family | hits | saved | skipped |");
        let _ = writeln!(out, "|---|---|---|---|");
        let mut ranked: Vec<(&String, &FamilyRecord)> = families.iter().collect();
        ranked.sort_by(|a, b| b.1.count.cmp(&a.1.count));
        for (key, record) in ranked.into_iter().take(10) {
            let _ = writeln!(
                out,
                "| `{}` | {} | {} | {} |",
                key, record.count, record.samples_saved, record.skipped
            );
        }
    }

    if !metrics.errors().is_empty() {
        let _ = writeln!(out, "\n## Errors\n");
        let _ = writeln!(out, "| kind | count |");
        let _ = writeln!(out, "|---|---|");
        let mut errors: Vec<(&String, &u64)> = metrics.errors().iter().collect();
        errors.sort_by(|a, b| b.1.cmp(a.1));
        for (kind, count) in errors {
            let _ = writeln!(out, "| {} | {} |", kind, count);
        }
    }

    if !files.is_empty() {
        let _ = writeln!(out, "\n## Recent artifacts\n");
        for artifact in files.iter().rev().take(20) {
            let _ = writeln!(
                out,
                "- `{}` <- {} ({} bytes)",
                artifact.path, artifact.url, artifact.size
            );
        }
    }

    write_atomic_at(&root.join(INDEX_FILE), out.as_bytes())
}
