//! Sync pipeline: keyword search, in-run dedup, sheet reconciliation, reports.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use otw_adapters::{adapter_for_source, load_captured_pages, CapturedPageSource};
use otw_core::ListingRecord;
use otw_storage::{
    GoogleSheetsStore, HttpFetcher, PageArchive, PageSource, PendingBatch, PendingBatchStore,
    SheetStore,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod dedup;
mod driver;
mod relevance;
mod reports;
mod sheet_sync;

pub use config::{
    ConfigError, SheetSettings, SourceConfig, SourceMode, SourceRegistry, SyncConfig,
    DEFAULT_PER_KEYWORD_LIMIT,
};
pub use dedup::{first_occurrences, SeenSet};
pub use driver::{
    AcceptedListing, CardOutcome, FetchOutcome, KeywordReport, KeywordSearchDriver, KeywordStatus,
    SearchRun, SearchSettings,
};
pub use relevance::{
    preprocess, ClassifierError, NaiveBayesClassifier, RelevanceClassifier, RelevanceSeeds,
    ScoredListing,
};
pub use reports::{
    daily_brief_markdown, write_run_report, CommitStatus, ParquetManifest, ParquetManifestFile,
    RunReport, SourceRunReport, NO_RESULTS_AR,
};
pub use sheet_sync::{sync_to_sheet, SheetSyncOutcome};

pub const CRATE_NAME: &str = "otw-sync";

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub accepted: usize,
    pub appended: usize,
    pub reports_dir: String,
    /// First store failure, if any; its records stay in the pending dir.
    pub commit_error: Option<String>,
}

impl SyncRunSummary {
    pub fn no_results(&self) -> bool {
        self.accepted == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingCommit {
    pub path: String,
    pub source_id: String,
    pub outcome: SheetSyncOutcome,
}

pub struct SyncPipeline {
    config: SyncConfig,
    archive: PageArchive,
    pending: PendingBatchStore,
    classifier: Box<dyn RelevanceClassifier>,
    today: Option<NaiveDate>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, classifier: Box<dyn RelevanceClassifier>) -> Self {
        Self {
            archive: PageArchive::new(config.artifacts_dir.clone()),
            pending: PendingBatchStore::new(config.pending_dir.clone()),
            config,
            classifier,
            today: None,
        }
    }

    /// Pin the date the today filter compares against.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One full pass over every enabled source. With no `store` the run is
    /// a dry run: nothing is committed and no pending batch is written.
    pub async fn run_once(&self, store: Option<&dyn SheetStore>) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = SourceRegistry::load(&self.config.sources_path()).await?;
        let sources: Vec<&SourceConfig> = registry.enabled().collect();
        if sources.is_empty() {
            warn!("no enabled sources in {}", self.config.sources_path().display());
        }

        let mut source_reports = Vec::with_capacity(sources.len());
        for source in &sources {
            let span = info_span!("source_sync", %run_id, source_id = %source.source_id);
            let report = self
                .run_source(run_id, source, store)
                .instrument(span)
                .await?;
            source_reports.push(report);
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: store.is_none(),
            sources: source_reports,
        };
        let reports_dir = write_run_report(&self.config.reports_dir, &report).await?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: report.finished_at,
            enabled_sources: sources.len(),
            accepted: report.total_listings(),
            appended: report
                .sources
                .iter()
                .filter_map(|s| s.sheet.as_ref())
                .map(|s| s.appended)
                .sum(),
            reports_dir: reports_dir.display().to_string(),
            commit_error: report.sources.iter().find_map(|s| s.error.clone()),
        };
        if summary.no_results() {
            info!(%run_id, "no results today");
        }
        info!(
            %run_id,
            accepted = summary.accepted,
            appended = summary.appended,
            reports_dir = %summary.reports_dir,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn run_source(
        &self,
        run_id: Uuid,
        source: &SourceConfig,
        store: Option<&dyn SheetStore>,
    ) -> Result<SourceRunReport> {
        let adapter = adapter_for_source(&source.source_id, &source.portal_settings())
            .with_context(|| format!("building adapter for {}", source.source_id))?
            .with_context(|| format!("no adapter registered for {}", source.source_id))?;
        let columns = source.column_set()?;
        let pages = self.page_source(source)?;

        let mut settings = SearchSettings::new(source.per_keyword_limit, source.require_today);
        settings.concurrency = self.config.keyword_concurrency;
        if let Some(today) = self.today {
            settings.today = today;
        }

        let search = KeywordSearchDriver::new(adapter.as_ref(), pages.as_ref(), settings)
            .with_archive(&self.archive)
            .run(&source.search_keywords())
            .await;

        let listings = self.classifier.classify(&search.accepted);

        let mut report = SourceRunReport {
            source_id: source.source_id.clone(),
            display_name: source.display_name.clone(),
            keywords: search.keywords.clone(),
            listings,
            commit: CommitStatus::DryRun,
            sheet: None,
            pending_batch: None,
            error: None,
        };

        let Some(store) = store else {
            return Ok(report);
        };
        if search.is_empty() {
            report.commit = CommitStatus::NothingToCommit;
            return Ok(report);
        }

        let batch = PendingBatch {
            run_id,
            source_id: source.source_id.clone(),
            created_at: Utc::now(),
            records: search.records(),
        };
        let pending_path = self.pending.save(&batch).await?;

        match sync_to_sheet(store, &columns, &batch.records).await {
            Ok(outcome) => {
                self.pending.remove(&pending_path).await?;
                report.commit = CommitStatus::Committed;
                report.sheet = Some(outcome);
            }
            Err(err) => {
                warn!(
                    error = %err,
                    pending = %pending_path.display(),
                    "sheet commit failed; batch kept for commit-pending"
                );
                report.commit = CommitStatus::Failed;
                report.error = Some(err.to_string());
                report.pending_batch = Some(pending_path.display().to_string());
            }
        }
        Ok(report)
    }

    fn page_source(&self, source: &SourceConfig) -> Result<Box<dyn PageSource>> {
        let pages: Box<dyn PageSource> = match source.mode {
            SourceMode::Live => Box::new(HttpFetcher::new(self.config.http_client_config())?),
            SourceMode::Fixture => {
                let pages = load_captured_pages(self.config.fixtures_dir(), &source.source_id)?;
                info!(pages = pages.len(), "replaying captured pages");
                Box::new(CapturedPageSource::new(pages))
            }
        };
        Ok(pages)
    }

    /// Replay every pending batch, oldest first. Stops at the first failure,
    /// leaving that batch and the ones after it in place.
    pub async fn commit_pending(&self, store: &dyn SheetStore) -> Result<Vec<PendingCommit>> {
        let paths = self.pending.list().await?;
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let sources_path = self.config.sources_path();
        let registry = SourceRegistry::load(&sources_path)
            .await
            .with_context(|| format!("loading {} for pending replay", sources_path.display()))?;

        let mut commits = Vec::new();
        for path in paths {
            let batch = self.pending.load(&path).await?;
            // sources removed since the batch was written use the built-in header
            let columns = registry
                .sources
                .iter()
                .find(|s| s.source_id == batch.source_id)
                .map(|s| s.column_set())
                .transpose()?
                .unwrap_or_default();
            let records: Vec<ListingRecord> = first_occurrences(batch.records);

            let outcome = sync_to_sheet(store, &columns, &records)
                .await
                .with_context(|| format!("committing {}", path.display()))?;
            self.pending.remove(&path).await?;
            info!(path = %path.display(), appended = outcome.appended, "pending batch committed");
            commits.push(PendingCommit {
                path: path.display().to_string(),
                source_id: batch.source_id,
                outcome,
            });
        }
        Ok(commits)
    }

    /// Cron-driven runs of [`SyncPipeline::run_once`], or `None` when
    /// `OTW_SCHEDULER_ENABLED` is off. A tick that fires while the previous run
    /// is still going is skipped.
    pub async fn maybe_build_scheduler(
        self: Arc<Self>,
        store: Option<Arc<dyn SheetStore>>,
    ) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let running = Arc::new(Mutex::new(()));
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&self);
            let store = store.clone();
            let running = Arc::clone(&running);
            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    warn!("previous sync still running; skipping scheduled run");
                    return;
                };
                match pipeline.run_once(store.as_deref()).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        accepted = summary.accepted,
                        "scheduled sync finished"
                    ),
                    Err(err) => {
                        let error = format!("{err:#}");
                        warn!(%error, "scheduled sync failed");
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Trains the default classifier from `rules/relevance.yaml`.
pub fn load_classifier(config: &SyncConfig) -> Result<NaiveBayesClassifier> {
    let seeds = RelevanceSeeds::load(&config.relevance_rules_path())?;
    NaiveBayesClassifier::train(&seeds).context("training relevance classifier")
}

/// The configured Google Sheets store.
pub fn sheet_store_from_config(config: &SyncConfig) -> Result<GoogleSheetsStore> {
    let google = config.sheet.google_config()?;
    GoogleSheetsStore::new(google).context("building Google Sheets client")
}

pub fn pipeline_from_env() -> Result<SyncPipeline> {
    let config = SyncConfig::from_env();
    let classifier = load_classifier(&config)?;
    Ok(SyncPipeline::new(config, Box::new(classifier)))
}
