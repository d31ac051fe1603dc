use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use otw_core::{dates, RelevanceLabel};
use otw_storage::SheetStore;
use otw_sync::{
    load_classifier, pipeline_from_env, sheet_store_from_config, RelevanceClassifier, SyncConfig,
    NO_RESULTS_AR,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "otw")]
#[command(about = "Opportunity Tender Watch: keyword tender search synced to a spreadsheet")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search every keyword once and append new listings to the sheet.
    Sync {
        /// Scrape and write the report without touching the sheet.
        #[arg(long)]
        dry_run: bool,
    },
    /// Retry pending batches left behind by failed sheet commits.
    CommitPending,
    /// Run `sync` on the OTW_SYNC_CRON schedule until interrupted
    /// (requires OTW_SCHEDULER_ENABLED).
    Watch {
        #[arg(long)]
        dry_run: bool,
    },
    /// Score free text with the relevance classifier.
    Classify {
        #[arg(required = true)]
        texts: Vec<String>,
    },
    /// Check whether publication-date text means today.
    IsToday { text: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let pipeline = pipeline_from_env()?;
            let store = if dry_run {
                None
            } else {
                Some(sheet_store_from_config(pipeline.config())?)
            };
            let summary = pipeline
                .run_once(store.as_ref().map(|s| s as &dyn SheetStore))
                .await?;

            if summary.no_results() {
                println!("no results today ({NO_RESULTS_AR})");
            } else {
                println!(
                    "sync complete: run_id={} accepted={} appended={} reports={}",
                    summary.run_id, summary.accepted, summary.appended, summary.reports_dir
                );
            }
            if let Some(err) = summary.commit_error {
                bail!("sheet commit failed: {err}; run `otw commit-pending` to retry");
            }
        }
        Commands::CommitPending => {
            let pipeline = pipeline_from_env()?;
            let store = sheet_store_from_config(pipeline.config())?;
            let commits = pipeline.commit_pending(&store).await?;
            if commits.is_empty() {
                println!("no pending batches");
            }
            for commit in commits {
                println!(
                    "committed {} ({}): appended={} skipped={}",
                    commit.path, commit.source_id, commit.outcome.appended, commit.outcome.skipped
                );
            }
        }
        Commands::Watch { dry_run } => {
            let pipeline = pipeline_from_env()?;
            let store: Option<Arc<dyn SheetStore>> = if dry_run {
                None
            } else {
                Some(Arc::new(sheet_store_from_config(pipeline.config())?))
            };
            let cron = pipeline.config().sync_cron.clone();
            let Some(mut sched) = Arc::new(pipeline).maybe_build_scheduler(store).await? else {
                bail!("scheduler is disabled; set OTW_SCHEDULER_ENABLED=true to use `otw watch`");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "watching; press ctrl-c to stop");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Classify { texts } => {
            let classifier = load_classifier(&SyncConfig::from_env())?;
            for text in texts {
                let score = (classifier.score(&text) * 100.0).round() / 100.0;
                let label = RelevanceLabel::from_score(score);
                println!("{score:.2}\t{}\t{text}", label.arabic());
            }
        }
        Commands::IsToday { text } => {
            println!("{}", dates::is_today(&text));
        }
    }

    Ok(())
}
