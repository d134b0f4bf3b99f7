//! Match pipeline orchestration: crawl, ingest, score, select, persist, notify.

pub mod config;
pub mod normalize;
pub mod notify;
pub mod select;
pub mod similarity;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobscout_adapters::{FixtureSource, HtmlListingSource, PostingSource};
use jobscout_core::{NotificationBatch, PostingId, Profile, RawPosting};
use jobscout_storage::{HttpClientConfig, HttpFetcher, PostingStore};
use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{JobscoutConfig, NotifierKind, SourceConfig, DEFAULT_CONFIG_FILE};
pub use normalize::Normalizer;
pub use notify::{LogNotifier, Notifier, NotifyError, ReportNotifier};
pub use select::{MatchPolicy, MatchSelector, ThresholdPolicy, TitleFilter};
pub use similarity::{Analyzer, Candidate, RankedScore, SimilarityEngine};

pub const CRATE_NAME: &str = "jobscout-sync";

/// How long a source may overrun its deadline before the call is abandoned.
const DEADLINE_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub queries_attempted: usize,
    pub queries_failed: usize,
    pub crawl_timed_out: bool,
    pub fetched_postings: usize,
    pub new_postings: usize,
    pub refreshed_postings: usize,
    pub pruned_postings: usize,
    pub scored_postings: usize,
    pub batch: NotificationBatch,
    pub notify_error: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
struct CrawlOutcome {
    postings: Vec<RawPosting>,
    attempted: usize,
    failed: usize,
    timed_out: bool,
}

pub struct MatchPipeline {
    config: JobscoutConfig,
    profile: Profile,
    source: Box<dyn PostingSource>,
    notifier: Box<dyn Notifier>,
    normalizer: Normalizer,
    engine: SimilarityEngine,
    selector: MatchSelector,
    dry_run: bool,
}

impl MatchPipeline {
    pub fn new(
        config: JobscoutConfig,
        profile: Profile,
        source: Box<dyn PostingSource>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        let normalizer = Normalizer::new(config.similarity.stop_words);
        let engine = SimilarityEngine::new(config.similarity.analyzer);
        let selector = MatchSelector::new(config.matching.policy());
        Self {
            config,
            profile,
            source,
            notifier,
            normalizer,
            engine,
            selector,
            dry_run: false,
        }
    }

    pub fn from_config(config: JobscoutConfig) -> Result<Self> {
        config.validate()?;
        let profile = config.load_profile()?;
        let source = build_source(&config)?;
        let notifier = build_notifier(&config);
        Ok(Self::new(config, profile, source, notifier))
    }

    /// Score and select without saving the store or sending the batch.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "match_run",
            %run_id,
            source = self.source.source_id(),
            dry_run = self.dry_run
        );
        self.run_inner(run_id, now).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<RunSummary> {
        let started_at = Utc::now();
        let store_path = self.config.store_path();
        let mut store = PostingStore::load(&store_path)
            .await
            .with_context(|| format!("loading posting store {}", store_path.display()))?;

        let crawl = self.crawl().await;

        let mut new_postings = 0usize;
        let mut refreshed_postings = 0usize;
        for raw in &crawl.postings {
            let (_, outcome) = store.upsert(raw, now);
            if outcome.is_new() {
                new_postings += 1;
            } else {
                refreshed_postings += 1;
            }
        }

        let pruned_postings = match self.config.storage.retention_days {
            Some(days) => store.prune_stale(now, chrono::Duration::days(i64::from(days))),
            None => 0,
        };

        let in_scope = self.in_scope(&store);
        for id in &in_scope {
            if let Some(posting) = store.get(id) {
                let text = self.normalizer.normalize(&posting.document_text());
                store.set_normalized_text(id, text)?;
            }
        }

        let ranked = {
            let candidates: Vec<Candidate<'_>> = in_scope
                .iter()
                .filter_map(|id| {
                    store.get(id).map(|posting| Candidate {
                        id,
                        text: posting.normalized_text.as_str(),
                        first_seen: posting.first_seen,
                    })
                })
                .collect();
            let profile_text = self.normalizer.normalize(&self.profile.text);
            self.engine.rank(&candidates, &profile_text)
        };

        let batch = self.selector.select_and_mark(&mut store, &ranked, run_id, now)?;

        let mut notify_error = None;
        if self.dry_run {
            info!(selected = batch.len(), "dry run; store and notifier untouched");
        } else {
            store
                .save()
                .await
                .with_context(|| format!("saving posting store {}", store_path.display()))?;
            if !batch.is_empty() {
                if let Err(err) = self.notifier.send(&batch).await {
                    warn!(
                        notifier = self.notifier.name(),
                        error = %err,
                        selected = batch.len(),
                        "notification failed; postings stay marked notified"
                    );
                    notify_error = Some(err.to_string());
                }
            }
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            queries_attempted: crawl.attempted,
            queries_failed: crawl.failed,
            crawl_timed_out: crawl.timed_out,
            fetched_postings: crawl.postings.len(),
            new_postings,
            refreshed_postings,
            pruned_postings,
            scored_postings: ranked.len(),
            batch,
            notify_error,
            dry_run: self.dry_run,
        };
        info!(
            fetched = summary.fetched_postings,
            new = summary.new_postings,
            scored = summary.scored_postings,
            selected = summary.batch.len(),
            "match run finished"
        );
        Ok(summary)
    }

    /// Runs every query under its own deadline inside the shared crawl
    /// budget. Sources hand back what they collected by the deadline; a query
    /// that errors or overruns is skipped and earlier results are kept.
    async fn crawl(&self) -> CrawlOutcome {
        let per_query = Duration::from_millis(self.config.crawl.query_timeout_ms);
        let budget_end = Instant::now() + Duration::from_millis(self.config.crawl.crawl_budget_ms);
        let mut outcome = CrawlOutcome::default();

        for (index, query) in self.config.queries.iter().enumerate() {
            let remaining = budget_end.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    skipped = self.config.queries.len() - index,
                    "crawl budget exhausted; skipping remaining queries"
                );
                outcome.timed_out = true;
                break;
            }

            outcome.attempted += 1;
            let deadline = Instant::now() + per_query.min(remaining);
            let fetch = self.source.fetch_postings(query, deadline);
            match timeout_at(deadline + DEADLINE_GRACE, fetch).await {
                Ok(Ok(postings)) => {
                    if Instant::now() >= deadline {
                        warn!(
                            query = %query.label(),
                            count = postings.len(),
                            "query reached its deadline; keeping partial results"
                        );
                        outcome.timed_out = true;
                    } else {
                        info!(query = %query.label(), count = postings.len(), "fetched postings");
                    }
                    outcome.postings.extend(postings);
                }
                Ok(Err(err)) => {
                    warn!(query = %query.label(), error = %err, "query failed; skipping");
                    outcome.failed += 1;
                    outcome.timed_out |= Instant::now() >= deadline;
                }
                Err(_) => {
                    warn!(query = %query.label(), "source ignored its deadline; skipping");
                    outcome.failed += 1;
                    outcome.timed_out = true;
                }
            }
        }
        outcome
    }

    /// Never-scored postings always; earlier unnotified ones when re-ranking
    /// is on; notified ones only to refresh their scores.
    fn in_scope(&self, store: &PostingStore) -> Vec<PostingId> {
        let matching = &self.config.matching;
        store
            .iter()
            .filter(|(_, posting)| {
                if posting.notified {
                    matching.rescore_notified
                } else {
                    matching.rescore_unnotified || posting.last_score.is_none()
                }
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

pub fn build_source(config: &JobscoutConfig) -> Result<Box<dyn PostingSource>> {
    match &config.source {
        SourceConfig::Fixture { path } => {
            let path = config.resolve(path);
            let source = FixtureSource::from_path(&path)
                .with_context(|| format!("loading fixture source {}", path.display()))?;
            Ok(Box::new(source))
        }
        SourceConfig::Html {
            source_id,
            search_url,
            page_size,
        } => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.crawl.http_timeout_secs),
                user_agent: Some(config.crawl.user_agent.clone()),
                request_interval: Duration::from_millis(config.crawl.request_delay_ms),
                ..Default::default()
            })?;
            Ok(Box::new(HtmlListingSource::new(
                source_id.clone(),
                search_url,
                *page_size,
                http,
            )?))
        }
    }
}

pub fn build_notifier(config: &JobscoutConfig) -> Box<dyn Notifier> {
    match config.notifier {
        NotifierKind::Log => Box::new(LogNotifier),
        NotifierKind::Report => Box::new(ReportNotifier::new(config.reports_dir())),
    }
}

/// Loads the config at `path`, applies env overrides and runs the pipeline
/// once. `fixtures` swaps the configured source for a fixture bundle.
pub async fn run_once_from_config(
    path: &Path,
    fixtures: Option<&Path>,
    dry_run: bool,
) -> Result<RunSummary> {
    let mut config = JobscoutConfig::load(path)?;
    config.apply_env_overrides()?;
    if let Some(fixtures) = fixtures {
        let fixtures = if fixtures.is_absolute() {
            fixtures.to_path_buf()
        } else {
            std::env::current_dir()
                .context("resolving current directory")?
                .join(fixtures)
        };
        config.source = SourceConfig::Fixture { path: fixtures };
    }
    MatchPipeline::from_config(config)?
        .with_dry_run(dry_run)
        .run_once()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use jobscout_adapters::{CrawlQuery, FetchError};
    use std::sync::{Arc, Mutex};

    struct StaticSource(Vec<RawPosting>);

    #[async_trait]
    impl PostingSource for StaticSource {
        fn source_id(&self) -> &str {
            "static"
        }

        async fn fetch_postings(
            &self,
            _query: &CrawlQuery,
            _deadline: Instant,
        ) -> Result<Vec<RawPosting>, FetchError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Vec<PostingId>>>>);

    #[async_trait]
    impl Notifier for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn send(&self, batch: &NotificationBatch) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(batch.ids());
            Ok(())
        }
    }

    fn posting(id: &str, title: &str, description: &str) -> RawPosting {
        RawPosting {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    fn config(dir: &Path) -> JobscoutConfig {
        JobscoutConfig {
            queries: vec![CrawlQuery::new("engineer")],
            workspace_root: dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 8, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn dry_run_leaves_store_and_notifier_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::default();
        let pipeline = MatchPipeline::new(
            config(dir.path()),
            Profile::new("rust backend engineer"),
            Box::new(StaticSource(vec![posting("1", "Rust Backend Engineer", "")])),
            Box::new(recorder.clone()),
        )
        .with_dry_run(true);

        let summary = pipeline.run_at(at(1)).await.unwrap();

        assert!(summary.dry_run);
        assert_eq!(summary.batch.len(), 1);
        assert!(recorder.0.lock().unwrap().is_empty());
        assert!(!dir.path().join("state/postings.json").exists());
    }

    #[tokio::test]
    async fn notified_postings_can_be_rescored_but_not_resent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.matching.rescore_notified = true;
        let recorder = Recorder::default();
        let pipeline = MatchPipeline::new(
            config,
            Profile::new("rust backend engineer"),
            Box::new(StaticSource(vec![
                posting("1", "Rust Backend Engineer", ""),
                posting("2", "Pastry Chef", "croissants"),
            ])),
            Box::new(recorder.clone()),
        );

        let first = pipeline.run_at(at(1)).await.unwrap();
        let second = pipeline.run_at(at(2)).await.unwrap();

        assert_eq!(first.batch.ids(), vec![PostingId::new("site:1")]);
        assert_eq!(second.scored_postings, 2);
        assert!(second.batch.is_empty());
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retention_prunes_postings_not_seen_recently() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.storage.retention_days = Some(7);
        let store_path = config.store_path();

        let mut store = PostingStore::empty(&store_path);
        store.upsert(&posting("old", "Retired Role", ""), at(1) - chrono::Duration::days(30));
        store.save().await.unwrap();

        let pipeline = MatchPipeline::new(
            config,
            Profile::new("rust engineer"),
            Box::new(StaticSource(vec![posting("1", "Rust Engineer", "")])),
            Box::new(LogNotifier),
        );
        let summary = pipeline.run_at(at(1)).await.unwrap();

        assert_eq!(summary.pruned_postings, 1);
        let store = PostingStore::load(&store_path).await.unwrap();
        assert!(store.get(&PostingId::new("site:old")).is_none());
        assert_eq!(store.len(), 1);
    }
}
