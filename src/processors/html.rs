//! HTML reduction: exact and near-duplicate checks, family quota, link
//! discovery, and atomic page persistence.

use super::{Discovered, ProcessContext, ProcessError, ProcessOutcome, ProcessStatus};
use crate::canonical::UrlRecord;
use crate::dedup::{content_hash, simhash};
use crate::family::{FamilyDecision, SampleStats};
use crate::manifest::{ArtifactRecord, CodexEntry};
use crate::scheduler::WorkItem;
use crate::storage::ArtifactKind;
use scraper::{Html, Selector};
use std::collections::{HashMap, HashSet};

/// Query keys that page through the same collection.
const PAGINATION_PARAMS: &[&str] = &["page", "offset", "cursor"];

struct LinkSelectors {
    anchors: Selector,
    links: Selector,
    scripts: Selector,
    images: Selector,
    forms: Selector,
    meta_refresh: Selector,
    title: Selector,
}

impl LinkSelectors {
    fn new() -> Self {
        Self {
            anchors: Selector::parse("a[href]").expect("anchor selector"),
            links: Selector::parse("link[href]").expect("link selector"),
            scripts: Selector::parse("script[src]").expect("script selector"),
            images: Selector::parse("img[src]").expect("img selector"),
            forms: Selector::parse("form[action]").expect("form selector"),
            meta_refresh: Selector::parse(r#"meta[http-equiv]"#).expect("meta selector"),
            title: Selector::parse("title").expect("title selector"),
        }
    }
}

pub struct HtmlProcessor {
    selectors: LinkSelectors,
    /// First saved body text per pagination sibling group.
    pagination_baselines: HashMap<String, String>,
}

impl HtmlProcessor {
    pub fn new() -> Self {
        Self {
            selectors: LinkSelectors::new(),
            pagination_baselines: HashMap::new(),
        }
    }

    pub fn process(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        item: &WorkItem,
        record: &UrlRecord,
        status: u16,
        html: &str,
    ) -> Result<ProcessOutcome, ProcessError> {
        let body_bytes = html.as_bytes();
        let sha256 = content_hash(body_bytes);
        if ctx.dedup.seen_content(&sha256) {
            return Ok(ProcessOutcome::skipped(ProcessStatus::Duplicate));
        }

        let document = Html::parse_document(html);
        let text = collect_text(&document);
        let fingerprint = simhash(&text, ctx.heuristics.simhash_shingle_size);
        if let Some((similarity, other)) = ctx
            .dedup
            .near_duplicate_html(fingerprint, ctx.heuristics.html_similarity_drop)
        {
            tracing::debug!(
                event = "duplicate",
                url = %record.canonical,
                similar_to = other,
                similarity,
                "near-duplicate page dropped"
            );
            return Ok(ProcessOutcome::skipped(ProcessStatus::Duplicate));
        }

        let title = self.extract_title(&document);
        let stats = SampleStats {
            title_len: title.as_deref().map(|t| t.len()).unwrap_or(0),
            body_len: text.len(),
            status,
        };

        let family_key = ctx.families.family_key(record);
        ctx.families.observe(&family_key);
        if ctx.families.decide(&family_key, stats) == FamilyDecision::Skip {
            return Ok(ProcessOutcome::skipped(ProcessStatus::FamilySkipped));
        }

        // Pagination siblings: save only when the content moved enough
        // relative to the first saved sibling.
        if let Some(sibling_key) = pagination_sibling_key(record) {
            if let Some(baseline) = self.pagination_baselines.get(&sibling_key) {
                if text_diff_ratio(baseline, &text) <= ctx.heuristics.pagination_diff_ratio {
                    return Ok(ProcessOutcome::skipped(ProcessStatus::Duplicate));
                }
            } else {
                self.pagination_baselines
                    .insert(sibling_key, text.clone());
            }
        }

        let relative = ctx.storage.path_for(ArtifactKind::Html, record);
        ctx.storage.write_atomic(&relative, body_bytes)?;

        ctx.families.record_saved(&family_key, stats);
        ctx.dedup.mark_content(&sha256);
        ctx.dedup.register_html_fingerprint(fingerprint, &record.canonical);

        let discovered = self.extract_links(&document);

        let mut hints = Vec::new();
        if let Some(t) = &title {
            hints.push(format!("title:{}", t.chars().take(80).collect::<String>()));
        }

        let artifact = ArtifactRecord {
            kind: "html".to_string(),
            url: record.canonical.clone(),
            path: relative.clone(),
            sha256: sha256.clone(),
            size: body_bytes.len(),
            status,
            depth: item.meta.depth,
            captured_at: super::unix_now(),
            redacted: false,
        };
        let codex = CodexEntry {
            path: relative,
            kind: "html".to_string(),
            sha256,
            url: record.canonical.clone(),
            priority: item.score,
            hints,
        };

        Ok(ProcessOutcome {
            status: ProcessStatus::Saved,
            artifact: Some((artifact, codex)),
            discovered,
            endpoints: Vec::new(),
            redacted: false,
        })
    }

    fn extract_title(&self, document: &Html) -> Option<String> {
        document
            .select(&self.selectors.title)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    }

    /// Raw href/src/action values plus meta-refresh targets, in document
    /// order, deduplicated. Resolution happens at enqueue time.
    fn extract_links(&self, document: &Html) -> Vec<Discovered> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        let mut push = |raw: &str| {
            let raw = raw.trim();
            if raw.is_empty()
                || raw.starts_with('#')
                || raw.starts_with("javascript:")
                || raw.starts_with("mailto:")
                || raw.starts_with("data:")
            {
                return;
            }
            if seen.insert(raw.to_string()) {
                out.push(Discovered {
                    url: raw.to_string(),
                    reason: "html-discovery",
                });
            }
        };

        for el in document.select(&self.selectors.anchors) {
            if let Some(href) = el.value().attr("href") {
                push(href);
            }
        }
        for el in document.select(&self.selectors.links) {
            if let Some(href) = el.value().attr("href") {
                push(href);
            }
        }
        for el in document.select(&self.selectors.scripts) {
            if let Some(src) = el.value().attr("src") {
                push(src);
            }
        }
        for el in document.select(&self.selectors.images) {
            if let Some(src) = el.value().attr("src") {
                push(src);
            }
        }
        for el in document.select(&self.selectors.forms) {
            if let Some(action) = el.value().attr("action") {
                push(action);
            }
        }
        for el in document.select(&self.selectors.meta_refresh) {
            let is_refresh = el
                .value()
                .attr("http-equiv")
                .map(|v| v.eq_ignore_ascii_case("refresh"))
                .unwrap_or(false);
            if !is_refresh {
                continue;
            }
            if let Some(content) = el.value().attr("content") {
                if let Some(url) = parse_meta_refresh(content) {
                    push(&url);
                }
            }
        }

        out
    }
}

impl Default for HtmlProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// `content="5;url=/next"` → `/next`.
fn parse_meta_refresh(content: &str) -> Option<String> {
    let (_, rest) = content.split_once(';')?;
    let rest = rest.trim();
    let url = rest
        .strip_prefix("url=")
        .or_else(|| rest.strip_prefix("URL="))
        .or_else(|| rest.strip_prefix("Url="))?;
    let url = url.trim().trim_matches('\'').trim_matches('"');
    if url.is_empty() {
        None
    } else {
        Some(url.to_string())
    }
}

/// Canonical URL minus pagination parameters, or None when the URL carries
/// no pagination parameter at all.
fn pagination_sibling_key(record: &UrlRecord) -> Option<String> {
    let query = record.query.as_deref()?;
    let mut had_pagination = false;
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or("").to_ascii_lowercase();
            if PAGINATION_PARAMS.contains(&key.as_str()) {
                had_pagination = true;
                false
            } else {
                true
            }
        })
        .collect();

    if !had_pagination {
        return None;
    }
    Some(format!(
        "{}{}?{}",
        record.host,
        record.path,
        kept.join("&")
    ))
}

/// Fraction of word-level difference between two texts (1 - Jaccard).
fn text_diff_ratio(a: &str, b: &str) -> f64 {
    let set_a: HashSet<&str> = a.split_whitespace().collect();
    let set_b: HashSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    1.0 - intersection / union
}

fn collect_text(document: &Html) -> String {
    let mut out = String::new();
    for piece in document.root_element().text() {
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(trimmed);
        }
    }
    out
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
            score: 0.5,
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

    const PAGE: &str = r#"<html><head><title>Products</title>
        <link href="/styles/site.css" rel="stylesheet">
        <meta http-equiv="refresh" content="3;url=/landing">
        </head><body>
        <a href="/store/item/1">one</a>
        <a href="https://other.test/x">ext</a>
        <script src="/static/app.js"></script>
        <img src="/img/logo.png">
        <form action="/search"></form>
        <p>Catalog of interesting products for testing purposes.</p>
        </body></html>"#;

    #[test]
    fn saves_page_and_discovers_links() {
        let mut h = Harness::new();
        let mut processor = HtmlProcessor::new();
        let mut ctx = h.ctx();
        let outcome = processor
            .process(&mut ctx, &item("https://a.test/catalog"), &record("https://a.test/catalog"), 200, PAGE)
            .unwrap();

        assert_eq!(outcome.status, ProcessStatus::Saved);
        let (artifact, codex) = outcome.artifact.unwrap();
        assert_eq!(artifact.kind, "html");
        assert!(artifact.path.starts_with("pages/"));
        assert!(codex.hints.iter().any(|hint| hint.contains("Products")));

        let urls: Vec<&str> = outcome.discovered.iter().map(|d| d.url.as_str()).collect();
        assert!(urls.contains(&"/store/item/1"));
        assert!(urls.contains(&"https://other.test/x"));
        assert!(urls.contains(&"/static/app.js"));
        assert!(urls.contains(&"/img/logo.png"));
        assert!(urls.contains(&"/search"));
        assert!(urls.contains(&"/styles/site.css"));
        assert!(urls.contains(&"/landing"));
    }

    #[test]
    fn exact_duplicate_is_dropped() {
        let mut h = Harness::new();
        let mut processor = HtmlProcessor::new();

        let mut ctx = h.ctx();
        let first = processor
            .process(&mut ctx, &item("https://a.test/p1"), &record("https://a.test/p1"), 200, PAGE)
            .unwrap();
        assert_eq!(first.status, ProcessStatus::Saved);

        let mut ctx = h.ctx();
        let second = processor
            .process(&mut ctx, &item("https://a.test/p2"), &record("https://a.test/p2"), 200, PAGE)
            .unwrap();
        assert_eq!(second.status, ProcessStatus::Duplicate);
        assert!(second.artifact.is_none());
    }

    #[test]
    fn near_duplicate_templates_collapse() {
        let mut h = Harness::new();
        let mut processor = HtmlProcessor::new();

        let base_body = "This shared template body stays identical across generated pages with only tiny differences in a counter value somewhere deep in the footer of the layout";
        let mut saved = 0;
        for i in 0..10 {
            let html = format!(
                "<html><head><title>T</title></head><body><p>{} marker-{}</p></body></html>",
                base_body, i % 2
            );
            let url = format!("https://a.test/gen/page{}", i);
            let mut ctx = h.ctx();
            let outcome = processor
                .process(&mut ctx, &item(&url), &record(&url), 200, &html)
                .unwrap();
            if outcome.status == ProcessStatus::Saved {
                saved += 1;
            }
        }
        assert!(saved <= 2, "saved {} of 10 near-identical pages", saved);
    }

    #[test]
    fn pagination_sibling_with_small_diff_skipped() {
        let mut h = Harness::new();
        // Disable the SimHash gate so the pagination policy itself decides.
        h.heuristics.html_similarity_drop = 1.0;
        let mut processor = HtmlProcessor::new();

        let body = "<html><body><p>alpha beta gamma delta epsilon zeta eta theta iota \
            kappa lambda mu nu xi omicron pi rho sigma tau upsilon</p></body></html>";
        let mut ctx = h.ctx();
        let first = processor
            .process(
                &mut ctx,
                &item("https://a.test/list?page=1"),
                &record("https://a.test/list?page=1"),
                200,
                body,
            )
            .unwrap();
        assert_eq!(first.status, ProcessStatus::Saved);

        // Page 2 with one word changed out of twenty: below the threshold.
        let body2 = "<html><body><p>alpha beta gamma delta epsilon zeta eta theta iota \
            kappa lambda mu nu xi omicron pi rho sigma tau phi</p></body></html>";
        let mut ctx = h.ctx();
        let second = processor
            .process(
                &mut ctx,
                &item("https://a.test/list?page=2"),
                &record("https://a.test/list?page=2"),
                200,
                body2,
            )
            .unwrap();
        assert_eq!(second.status, ProcessStatus::Duplicate);

        // A genuinely different page 3 passes the diff gate and saves.
        let body3 = "<html><body><p>completely rewritten listing with entirely fresh \
            vocabulary covering other products and unrelated descriptions here now</p></body></html>";
        let mut ctx = h.ctx();
        let third = processor
            .process(
                &mut ctx,
                &item("https://a.test/list?page=3"),
                &record("https://a.test/list?page=3"),
                200,
                body3,
            )
            .unwrap();
        assert_eq!(third.status, ProcessStatus::Saved);
    }

    #[test]
    fn meta_refresh_parses_url_variants() {
        assert_eq!(parse_meta_refresh("5;url=/next"), Some("/next".to_string()));
        assert_eq!(
            parse_meta_refresh("0; URL='https://a.test/x'"),
            Some("https://a.test/x".to_string())
        );
        assert_eq!(parse_meta_refresh("5"), None);
    }

    #[test]
    fn diff_ratio_behaves() {
        assert_eq!(text_diff_ratio("a b c", "a b c"), 0.0);
        assert!(text_diff_ratio("a b c d", "a b c e") > 0.0);
        assert_eq!(text_diff_ratio("a", "b"), 1.0);
    }
}
