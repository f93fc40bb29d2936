//! JavaScript bundle handling: fingerprint-family dedup, endpoint scanning,
//! and same-origin source-map enumeration.

use super::{Discovered, ProcessContext, ProcessError, ProcessOutcome, ProcessStatus};
use crate::canonical::UrlRecord;
use crate::dedup::content_hash;
use crate::manifest::{ArtifactRecord, CodexEntry, EndpointRecord};
use crate::scheduler::WorkItem;
use crate::storage::ArtifactKind;
use regex::Regex;
use std::collections::HashSet;
use url::Url;

pub struct JsProcessor {
    fetch_call: Regex,
    axios_call: Regex,
    graphql_call: Regex,
    bare_literal: Regex,
    absolute_url: Regex,
    source_map: Regex,
    fingerprint: Regex,
    seen_fingerprints: HashSet<String>,
}

impl JsProcessor {
    pub fn new() -> Self {
        Self {
            fetch_call: Regex::new(r#"fetch\(\s*['"`]([^'"`]+)['"`]"#).expect("fetch pattern"),
            axios_call: Regex::new(
                r#"axios\.(?:get|post|put|delete|patch)\(\s*['"`]([^'"`]+)['"`]"#,
            )
            .expect("axios pattern"),
            graphql_call: Regex::new(r#"graphql\(\s*['"`]([^'"`]+)['"`]"#).expect("graphql pattern"),
            bare_literal: Regex::new(r#"['"`](/(?:api|v1|v2|graphql)(?:/[^'"`\s]*)?)['"`]"#)
                .expect("bare literal pattern"),
            absolute_url: Regex::new(r#"['"`](https?://[^'"`\s]+)['"`]"#)
                .expect("absolute url pattern"),
            source_map: Regex::new(r"//# sourceMappingURL=(\S+)").expect("source map pattern"),
            fingerprint: Regex::new(r"^(?P<stem>.+)\.[a-f0-9]{6,}\.js$").expect("fingerprint pattern"),
            seen_fingerprints: HashSet::new(),
        }
    }

    pub fn process(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        item: &WorkItem,
        record: &UrlRecord,
        status: u16,
        body: &[u8],
    ) -> Result<ProcessOutcome, ProcessError> {
        let sha256 = content_hash(body);
        if ctx.dedup.seen_content(&sha256) {
            return Ok(ProcessOutcome::skipped(ProcessStatus::Duplicate));
        }

        // Build-fingerprinted bundles: one copy per stem is enough.
        let basename = record.path.rsplit('/').next().unwrap_or("");
        if let Some(captures) = self.fingerprint.captures(basename) {
            let stem = format!("{}:{}", record.host, &captures["stem"]);
            if !self.seen_fingerprints.insert(stem) {
                return Ok(ProcessOutcome::skipped(ProcessStatus::Duplicate));
            }
        }

        let source = String::from_utf8_lossy(body);
        let endpoints = self.scan_endpoints(&source, item.score);
        let mut discovered = Vec::new();

        for endpoint in &endpoints {
            discovered.push(Discovered {
                url: endpoint.url.clone(),
                reason: "js-endpoint",
            });
        }

        if let Some(map_url) = self.same_origin_source_map(&source, record) {
            discovered.push(Discovered {
                url: map_url,
                reason: "js-sourcemap",
            });
        }

        let relative = ctx.storage.path_for(ArtifactKind::Js, record);
        ctx.storage.write_atomic(&relative, body)?;
        ctx.dedup.mark_content(&sha256);

        let mut hints: Vec<String> = endpoints.iter().take(10).map(|e| e.url.clone()).collect();
        if !endpoints.is_empty() {
            hints.insert(0, "signal:endpoints".to_string());
        }

        let artifact = ArtifactRecord {
            kind: "js".to_string(),
            url: record.canonical.clone(),
            path: relative.clone(),
            sha256: sha256.clone(),
            size: body.len(),
            status,
            depth: item.meta.depth,
            captured_at: super::unix_now(),
            redacted: false,
        };
        let codex = CodexEntry {
            path: relative,
            kind: "js".to_string(),
            sha256,
            url: record.canonical.clone(),
            priority: item.score,
            hints,
        };

        Ok(ProcessOutcome {
            status: ProcessStatus::Saved,
            artifact: Some((artifact, codex)),
            discovered,
            endpoints,
            redacted: false,
        })
    }

    /// Literal endpoint candidates from call sites and path-shaped strings.
    fn scan_endpoints(&self, source: &str, base_score: f64) -> Vec<EndpointRecord> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        let mut push = |candidate: &str| {
            let candidate = candidate.trim();
            if candidate.is_empty() || candidate.len() > 2048 {
                return;
            }
            if seen.insert(candidate.to_string()) {
                out.push(EndpointRecord {
                    url: candidate.to_string(),
                    source: "js".to_string(),
                    score: base_score,
                });
            }
        };

        for re in [&self.fetch_call, &self.axios_call, &self.graphql_call] {
            for captures in re.captures_iter(source) {
                push(&captures[1]);
            }
        }
        for captures in self.bare_literal.captures_iter(source) {
            push(&captures[1]);
        }
        for captures in self.absolute_url.captures_iter(source) {
            push(&captures[1]);
        }

        out
    }

    /// The referenced source map, only when it resolves to the bundle's own
    /// origin. Everything else is dropped before any fetch can happen.
    fn same_origin_source_map(&self, source: &str, record: &UrlRecord) -> Option<String> {
        let captures = self.source_map.captures(source)?;
        let reference = captures[1].trim();

        let base = Url::parse(&record.canonical).ok()?;
        let resolved = base.join(reference).ok()?;
        let same_origin = resolved.scheme() == record.scheme
            && resolved.host_str().map(|h| h.to_ascii_lowercase()) == Some(record.host.clone());
        if same_origin {
            Some(resolved.to_string())
        } else {
            None
        }
    }
}

impl Default for JsProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{canonicalize, CanonicalRules};
    use crate::config::Heuristics;
    use crate::dedup::DedupIndex;
    use crate::family::FamilyTracker;
    use crate::scheduler::WorkMeta;
    use crate::storage::Storage;
    use tempfile::TempDir;

    fn record(url: &str) -> UrlRecord {
        canonicalize(url, None, &CanonicalRules::default()).unwrap()
    }

    fn item(url: &str) -> WorkItem {
        let rec = record(url);
        WorkItem {
            url_key: rec.url_key,
            url: rec.canonical,
            meta: WorkMeta {
                depth: 1,
                reason: "test".to_string(),
                parent: None,
            },
            score: 0.6,
        }
    }

    struct Harness {
        _dir: TempDir,
        storage: Storage,
        dedup: DedupIndex,
        families: FamilyTracker,
        heuristics: Heuristics,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let storage = Storage::new(dir.path().to_path_buf(), "pages", "js", "api").unwrap();
            Self {
                _dir: dir,
                storage,
                dedup: DedupIndex::new(),
                families: FamilyTracker::new(3),
                heuristics: Heuristics::default(),
            }
        }

        fn ctx(&mut self) -> ProcessContext<'_> {
            ProcessContext {
                dedup: &mut self.dedup,
                families: &mut self.families,
                storage: &self.storage,
                heuristics: &self.heuristics,
            }
        }
    }

    #[test]
    fn extracts_call_sites_and_literals() {
        let mut h = Harness::new();
        let mut processor = JsProcessor::new();
        let body = br#"
            fetch('/api/login');
            axios.get('https://api.target.com/v2/users');
            graphql(`query { me }`);
            const path = "/v1/items/list";
            const page = 'https://cdn.other.com/asset';
        "#;

        let mut ctx = h.ctx();
        let outcome = processor
            .process(&mut ctx, &item("https://a.test/app.js"), &record("https://a.test/app.js"), 200, body)
            .unwrap();

        let urls: Vec<&str> = outcome.endpoints.iter().map(|e| e.url.as_str()).collect();
        assert!(urls.contains(&"/api/login"));
        assert!(urls.contains(&"https://api.target.com/v2/users"));
        assert!(urls.contains(&"/v1/items/list"));
        assert!(urls.contains(&"https://cdn.other.com/asset"));

        let reasons: HashSet<&str> = outcome.discovered.iter().map(|d| d.reason).collect();
        assert!(reasons.contains("js-endpoint"));
        assert!(outcome
            .artifact
            .as_ref()
            .unwrap()
            .1
            .hints
            .contains(&"signal:endpoints".to_string()));
    }

    #[test]
    fn fingerprint_families_keep_one_copy() {
        let mut h = Harness::new();
        let mut processor = JsProcessor::new();

        let mut ctx = h.ctx();
        let first = processor
            .process(
                &mut ctx,
                &item("https://a.test/static/main.abc123f.js"),
                &record("https://a.test/static/main.abc123f.js"),
                200,
                b"var a = 1;",
            )
            .unwrap();
        assert_eq!(first.status, ProcessStatus::Saved);

        let mut ctx = h.ctx();
        let second = processor
            .process(
                &mut ctx,
                &item("https://a.test/static/main.deadbef.js"),
                &record("https://a.test/static/main.deadbef.js"),
                200,
                b"var a = 2;",
            )
            .unwrap();
        assert_eq!(second.status, ProcessStatus::Duplicate);
    }

    #[test]
    fn source_map_must_be_same_origin() {
        let mut h = Harness::new();
        let mut processor = JsProcessor::new();

        let local = b"var x = 1;\n//# sourceMappingURL=app.js.map";
        let mut ctx = h.ctx();
        let outcome = processor
            .process(
                &mut ctx,
                &item("https://a.test/js/app.js"),
                &record("https://a.test/js/app.js"),
                200,
                local,
            )
            .unwrap();
        assert!(outcome
            .discovered
            .iter()
            .any(|d| d.reason == "js-sourcemap" && d.url == "https://a.test/js/app.js.map"));

        let foreign = b"var x = 1;\n//# sourceMappingURL=https://cdn.other.com/app.js.map";
        let mut ctx = h.ctx();
        let outcome = processor
            .process(
                &mut ctx,
                &item("https://a.test/js/other.js"),
                &record("https://a.test/js/other.js"),
                200,
                foreign,
            )
            .unwrap();
        assert!(!outcome.discovered.iter().any(|d| d.reason == "js-sourcemap"));
    }

    #[test]
    fn identical_bundles_deduplicate_by_hash() {
        let mut h = Harness::new();
        let mut processor = JsProcessor::new();

        let body = b"console.log('same');";
        let mut ctx = h.ctx();
        assert_eq!(
            processor
                .process(&mut ctx, &item("https://a.test/a.js"), &record("https://a.test/a.js"), 200, body)
                .unwrap()
                .status,
            ProcessStatus::Saved
        );
        let mut ctx = h.ctx();
        assert_eq!(
            processor
                .process(&mut ctx, &item("https://a.test/b.js"), &record("https://a.test/b.js"), 200, body)
                .unwrap()
                .status,
            ProcessStatus::Duplicate
        );
    }
}
