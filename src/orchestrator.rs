//! The crawl control plane: a single supervised loop that owns every piece
//! of mutable state and drives SELECT -> FETCH -> ROUTE -> PROCESS ->
//! CHECKPOINT until a stop condition holds.

use crate::canonical::{canonicalize, CanonicalRules, UrlRecord};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::CrawlConfig;
use crate::dedup::DedupIndex;
use crate::family::FamilyTracker;
use crate::fetcher::{FetchStrategy, Fetcher, WaitFor};
use crate::manifest::{ManifestMeta, ManifestSink};
use crate::metrics::{BudgetCounters, RunMetrics};
use crate::processors::{
    ApiProcessor, Discovered, HtmlProcessor, JsProcessor, ProcessContext, ProcessOutcome,
    ProcessStatus,
};
use crate::router::{route, RoutedKind};
use crate::scheduler::{
    EnqueueOptions, EnqueueResult, Scheduler, ScoreWeights, StopLimits, WorkItem, WorkMeta,
};
use crate::scope::ScopeGuard;
use crate::storage::Storage;
use crate::summary;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    StopCondition(String),
    QueueExhausted,
    Cancelled,
}

impl RunEnd {
    pub fn as_str(&self) -> &str {
        match self {
            RunEnd::StopCondition(reason) => reason,
            RunEnd::QueueExhausted => "queue-exhausted",
            RunEnd::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub end: RunEnd,
    pub budget: BudgetCounters,
    pub artifacts: usize,
    pub duration_secs: u64,
}

/// All crawl state, owned by one logical thread. Components receive only
/// the slices they need; there is no shared global.
pub struct Orchestrator {
    config: CrawlConfig,
    rules: CanonicalRules,
    scope: ScopeGuard,
    scheduler: Scheduler,
    dedup: DedupIndex,
    families: FamilyTracker,
    html: HtmlProcessor,
    js: JsProcessor,
    api: ApiProcessor,
    storage: Storage,
    manifest: ManifestSink,
    checkpoints: CheckpointStore,
    metrics: RunMetrics,
    cancel: CancellationToken,
    strategy: FetchStrategy,
    started_at: u64,
}

impl Orchestrator {
    pub fn new(
        config: CrawlConfig,
        cancel: CancellationToken,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let scope = ScopeGuard::new(
            &config.target.allowed_domains,
            &config.target.disallowed_paths,
            &config.content.exclude_extensions,
        )?;

        let root = PathBuf::from(&config.output.root_dir);
        let storage = Storage::new(
            root.clone(),
            &config.output.store_pages_under,
            &config.output.store_js_under,
            &config.output.store_api_under,
        )?;

        let started_at = unix_now();
        let meta = ManifestMeta {
            target: config
                .target
                .base_urls
                .first()
                .cloned()
                .unwrap_or_default(),
            started_at,
            finished_at: None,
            config_hash: config.config_hash(),
            depth_max: config.crawl.depth_max,
            budgets_used: BudgetCounters::default(),
            budgets_max: BudgetCounters {
                pages: config.crawl.budgets.pages_max,
                js: config.crawl.budgets.js_max,
                api: config.crawl.budgets.api_max,
            },
        };
        let manifest = ManifestSink::new(&root, meta)?;
        let checkpoints = CheckpointStore::new(&root);

        let rules = CanonicalRules {
            drop_params: config.crawl.normalize_query.drop_params.clone(),
            sort_params: config.crawl.normalize_query.sort_params,
        };

        let scheduler = Scheduler::new(
            ScoreWeights::default(),
            StopLimits {
                pages_max: config.crawl.budgets.pages_max,
                js_max: config.crawl.budgets.js_max,
                api_max: config.crawl.budgets.api_max,
                time_max_secs: config.crawl.time_max_secs,
                error_rate_max: config.crawl.error_rate_max,
            },
        );

        let strategy = FetchStrategy {
            wait_for: WaitFor::DomContentLoaded,
            timeout: std::time::Duration::from_millis(config.crawl.timeout_ms),
            max_body_bytes: config.content.max_body_bytes,
        };

        let families = FamilyTracker::new(config.heuristics.family_max_samples)
            .with_outlier_threshold(config.heuristics.family_threshold);

        Ok(Self {
            config,
            rules,
            scope,
            scheduler,
            dedup: DedupIndex::new(),
            families,
            html: HtmlProcessor::new(),
            js: JsProcessor::new(),
            api: ApiProcessor::new(),
            storage,
            manifest,
            checkpoints,
            metrics: RunMetrics::new(),
            cancel,
            strategy,
            started_at,
        })
    }

    /// Enqueue the configured seeds. Seeds force their way in so a seed
    /// outside its own allowed-domain list still gets one fetch.
    pub fn seed(&mut self) {
        let base_urls = self.config.target.base_urls.clone();
        for base in &base_urls {
            match canonicalize(base, None, &self.rules) {
                Ok(record) => {
                    let result = self.scheduler.enqueue(
                        &record,
                        WorkMeta {
                            depth: 0,
                            reason: "seed".to_string(),
                            parent: None,
                        },
                        EnqueueOptions {
                            force: true,
                            score: None,
                        },
                        &self.scope,
                        &self.dedup,
                        &self.families,
                    );
                    if let EnqueueResult::Queued(score) = result {
                        self.metrics.enqueued += 1;
                        tracing::info!(event = "enqueue", url = %record.canonical, score, reason = "seed");
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %base, error = %e, "seed URL rejected");
                }
            }
        }
    }

    /// Continue a previous run: rebuild the seen-sets from the manifest,
    /// then restore the checkpointed queue with force.
    pub fn resume(&mut self) -> bool {
        let Some(checkpoint) = self.checkpoints.load() else {
            return false;
        };

        let prior = ManifestSink::load_prior_artifacts(self.storage.root());
        for artifact in &prior {
            self.dedup.mark_content(&artifact.sha256);
            if let Ok(record) = canonicalize(&artifact.url, None, &self.rules) {
                self.dedup.mark_url(&record.url_key);
            }
        }

        self.manifest.preload(prior.clone());
        self.metrics.budget = checkpoint.budget;
        self.started_at = checkpoint.started_at;
        let restored = self.scheduler.restore(
            checkpoint.pending,
            &self.scope,
            &self.dedup,
            &self.families,
            &self.rules,
        );

        tracing::info!(
            restored,
            prior_artifacts = prior.len(),
            "resumed from checkpoint"
        );
        restored > 0 || !prior.is_empty()
    }

    /// Drive the state machine to completion.
    pub async fn run(
        &mut self,
        fetcher: &dyn Fetcher,
    ) -> Result<RunOutcome, Box<dyn std::error::Error>> {
        let loop_start = std::time::Instant::now();
        tracing::info!(
            target_count = self.config.target.base_urls.len(),
            pending = self.scheduler.pending_len(),
            "crawl loop starting"
        );

        let end = loop {
            if self.cancel.is_cancelled() {
                break RunEnd::Cancelled;
            }

            if let Some(reason) = self.scheduler.should_stop(&self.metrics) {
                tracing::info!(event = "stop", reason = reason.as_str());
                break RunEnd::StopCondition(reason.as_str().to_string());
            }

            let Some(item) = self.scheduler.dequeue() else {
                break RunEnd::QueueExhausted;
            };
            self.metrics.dequeued += 1;
            tracing::debug!(event = "dequeue", url = %item.url, score = item.score);

            let record = match canonicalize(&item.url, None, &self.rules) {
                Ok(record) => record,
                Err(e) => {
                    self.metrics.record_error("invalid-url");
                    tracing::debug!(event = "skip", url = %item.url, reason = "invalid-url", error = %e);
                    continue;
                }
            };

            // At-most-once: the key is burned whether the fetch succeeds
            // or not.
            self.dedup.mark_url(&record.url_key);

            match fetcher.fetch(&record.canonical, &self.strategy).await {
                Ok(response) => {
                    self.metrics.record_fetch_outcome(true);
                    self.handle_response(&item, &record, response);
                }
                Err(error) => {
                    self.metrics.record_fetch_outcome(false);
                    self.metrics.record_error(error.kind());
                    self.scheduler.mark_failed(&item);
                    if error.is_access_denied() {
                        tracing::info!(event = "skip", url = %record.canonical, reason = "access-denied");
                    } else {
                        tracing::warn!(event = "error", url = %record.canonical, kind = error.kind(), error = %error);
                    }
                }
            }

            self.write_checkpoint(Some(&item.url));
            if let Err(e) =
                self.manifest
                    .maybe_flush(false, self.families.records(), self.metrics.errors())
            {
                tracing::warn!(error = %e, "periodic manifest flush failed");
            }
        };

        self.finalize(&end)?;

        Ok(RunOutcome {
            end,
            budget: self.metrics.budget,
            artifacts: self.manifest.files().len(),
            duration_secs: loop_start.elapsed().as_secs(),
        })
    }

    fn handle_response(
        &mut self,
        item: &WorkItem,
        record: &UrlRecord,
        response: crate::fetcher::FetchResponse,
    ) {
        let routed = route(&response, &record.path, &self.config.content.include_types);
        if routed == RoutedKind::Binary {
            self.metrics.record_error("unsupported-content-type");
            self.scheduler.mark_skipped(item, "binary");
            tracing::debug!(event = "skip", url = %record.canonical, reason = "binary");
            return;
        }

        let mut ctx = ProcessContext {
            dedup: &mut self.dedup,
            families: &mut self.families,
            storage: &self.storage,
            heuristics: &self.config.heuristics,
        };

        let result = match routed {
            RoutedKind::Html => {
                let html = response
                    .rendered_html
                    .clone()
                    .unwrap_or_else(|| String::from_utf8_lossy(&response.body).into_owned());
                self.html
                    .process(&mut ctx, item, record, response.status, &html)
            }
            RoutedKind::Js => self
                .js
                .process(&mut ctx, item, record, response.status, &response.body),
            RoutedKind::Api => self.api.process(&mut ctx, item, record, &response),
            RoutedKind::Binary => unreachable!("binary handled above"),
        };

        match result {
            Ok(outcome) => self.apply_outcome(item, record, routed, &response.final_url, outcome),
            Err(error) => {
                let kind = match &error {
                    crate::processors::ProcessError::Parse(_) => "process-parse",
                    crate::processors::ProcessError::Io(_) => "process-io",
                };
                self.metrics.record_error(kind);
                self.scheduler.mark_failed(item);
                tracing::warn!(event = "error", url = %record.canonical, kind, error = %error);
            }
        }
    }

    /// Apply a processor's result record: budget, manifest, discoveries.
    fn apply_outcome(
        &mut self,
        item: &WorkItem,
        record: &UrlRecord,
        routed: RoutedKind,
        final_url: &str,
        outcome: ProcessOutcome,
    ) {
        match outcome.status {
            ProcessStatus::Saved => {
                match routed {
                    RoutedKind::Html => self.metrics.budget.pages += 1,
                    RoutedKind::Js => self.metrics.budget.js += 1,
                    RoutedKind::Api => self.metrics.budget.api += 1,
                    RoutedKind::Binary => {}
                }
                if outcome.redacted {
                    self.metrics.redacted += 1;
                }
                self.scheduler.mark_processed(item);
            }
            ProcessStatus::Duplicate => {
                self.metrics.duplicates += 1;
                self.scheduler.mark_skipped(item, "duplicate");
                tracing::debug!(event = "duplicate", url = %record.canonical);
            }
            ProcessStatus::FamilySkipped => {
                self.metrics.family_skipped += 1;
                self.scheduler.mark_skipped(item, "family-skipped");
                tracing::debug!(event = "family-skipped", url = %record.canonical);
            }
        }

        if let Some((artifact, codex)) = outcome.artifact {
            if let Err(e) = self.manifest.register_artifact(artifact, codex) {
                tracing::warn!(error = %e, "artifact registration failed");
                self.metrics.record_error("process-io");
            }
            self.manifest.update_budgets(self.metrics.budget);
        }

        for endpoint in outcome.endpoints {
            self.manifest.record_endpoint(endpoint);
        }

        self.enqueue_discovered(item, record, final_url, outcome.discovered);
    }

    fn enqueue_discovered(
        &mut self,
        item: &WorkItem,
        parent: &UrlRecord,
        final_url: &str,
        discovered: Vec<Discovered>,
    ) {
        let next_depth = item.meta.depth + 1;
        if next_depth > self.config.crawl.depth_max {
            return;
        }

        let base = Url::parse(final_url)
            .or_else(|_| Url::parse(&parent.canonical))
            .ok();

        for found in discovered {
            let record = match canonicalize(&found.url, base.as_ref(), &self.rules) {
                Ok(record) => record,
                Err(_) => {
                    self.metrics.record_error("invalid-url");
                    continue;
                }
            };

            let result = self.scheduler.enqueue(
                &record,
                WorkMeta {
                    depth: next_depth,
                    reason: found.reason.to_string(),
                    parent: Some(parent.canonical.clone()),
                },
                EnqueueOptions::default(),
                &self.scope,
                &self.dedup,
                &self.families,
            );

            match result {
                EnqueueResult::Queued(score) => {
                    self.metrics.enqueued += 1;
                    tracing::debug!(
                        event = "enqueue",
                        url = %record.canonical,
                        score,
                        reason = found.reason
                    );
                }
                EnqueueResult::OutOfScope => {
                    // Parent was in scope, so the rejection is worth a line.
                    self.metrics.record_error("out-of-scope");
                    tracing::debug!(event = "skip", url = %record.canonical, reason = "out-of-scope");
                }
                EnqueueResult::AlreadyVisited | EnqueueResult::AlreadyPending => {}
            }
        }
    }

    fn write_checkpoint(&mut self, last_url: Option<&str>) {
        let checkpoint = Checkpoint {
            last_url: last_url.map(|u| u.to_string()),
            pending: self.scheduler.snapshot(),
            budget: self.metrics.budget,
            started_at: self.started_at,
            updated_at: unix_now(),
        };
        if let Err(e) = self.checkpoints.save(&checkpoint) {
            // Non-fatal: the next iteration tries again.
            tracing::warn!(error = %e, "checkpoint write failed");
            self.metrics.record_error("checkpoint-io");
        }
    }

    fn finalize(&mut self, end: &RunEnd) -> Result<(), Box<dyn std::error::Error>> {
        self.manifest.update_budgets(self.metrics.budget);
        self.manifest.mark_finished(unix_now());
        self.manifest
            .maybe_flush(true, self.families.records(), self.metrics.errors())?;
        self.write_checkpoint(None);

        summary::write_index(
            self.storage.root(),
            end.as_str(),
            &self.metrics,
            self.manifest.files(),
            self.families.records(),
            self.manifest.endpoints().len(),
        )?;

        if self.config.git.enable {
            // Versioning is an external collaborator; the handoff is the log line.
            tracing::info!(
                branch = self.config.git.branch.as_deref().unwrap_or("main"),
                "output tree ready for git commit"
            );
        }

        tracing::info!(
            event = "summary",
            end = end.as_str(),
            pages = self.metrics.budget.pages,
            js = self.metrics.budget.js,
            api = self.metrics.budget.api,
            duplicates = self.metrics.duplicates,
            "crawl finished"
        );
        Ok(())
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
