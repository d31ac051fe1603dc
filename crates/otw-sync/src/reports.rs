use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use otw_core::Column;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::driver::KeywordReport;
use crate::relevance::ScoredListing;
use crate::sheet_sync::SheetSyncOutcome;

pub const NO_RESULTS_AR: &str = "لا نتائج منشورة اليوم بالكلمات المحددة.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Committed,
    NothingToCommit,
    DryRun,
    Failed,
}

/// Everything one source contributed to a run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRunReport {
    pub source_id: String,
    pub display_name: String,
    pub keywords: Vec<KeywordReport>,
    pub listings: Vec<ScoredListing>,
    pub commit: CommitStatus,
    pub sheet: Option<SheetSyncOutcome>,
    pub pending_batch: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub sources: Vec<SourceRunReport>,
}

impl RunReport {
    pub fn total_listings(&self) -> usize {
        self.sources.iter().map(|s| s.listings.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `<reports_root>/<run_id>/` and returns that directory.
pub async fn write_run_report(reports_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let run_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    fs::write(run_dir.join("daily_brief.md"), daily_brief_markdown(report))
        .await
        .context("writing daily_brief.md")?;

    let delta = serde_json::to_vec_pretty(report).context("serializing listings delta")?;
    fs::write(run_dir.join("listings_delta.json"), delta)
        .await
        .context("writing listings_delta.json")?;

    export_parquet_snapshot(&run_dir, report).await?;
    Ok(run_dir)
}

pub fn daily_brief_markdown(report: &RunReport) -> String {
    let mut lines = vec![
        "# OTW Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Dry run: {}", if report.dry_run { "yes" } else { "no" }),
        format!("- Listings accepted: {}", report.total_listings()),
    ];

    for source in &report.sources {
        lines.push(String::new());
        lines.push(format!("## {} (`{}`)", source.display_name, source.source_id));
        lines.push(String::new());
        match (&source.sheet, source.commit) {
            (Some(sheet), _) => lines.push(format!(
                "Sheet: {} appended, {} skipped, {} already recorded{}.",
                sheet.appended,
                sheet.skipped,
                sheet.existing_keys,
                if sheet.header_repaired { ", header repaired" } else { "" }
            )),
            (None, CommitStatus::Failed) => lines.push(format!(
                "Sheet commit failed: {}. Pending batch: `{}`.",
                source.error.as_deref().unwrap_or("unknown error"),
                source.pending_batch.as_deref().unwrap_or("-")
            )),
            (None, CommitStatus::DryRun) => lines.push("Sheet: not touched (dry run).".to_string()),
            (None, _) => {}
        }

        lines.push(String::new());
        lines.push("| Keyword | Status | Cards | Accepted | Not today | Duplicates |".to_string());
        lines.push("|---|---|---|---|---|---|".to_string());
        for kw in &source.keywords {
            lines.push(format!(
                "| {} | {:?} | {} | {}{} | {} | {} |",
                kw.keyword,
                kw.status,
                kw.cards_found,
                kw.accepted,
                if kw.capped { " (cap)" } else { "" },
                kw.not_today,
                kw.duplicates
            ));
        }

        lines.push(String::new());
        if source.listings.is_empty() {
            lines.push(format!("No results today. {NO_RESULTS_AR}"));
            continue;
        }
        for listing in &source.listings {
            let record = &listing.record;
            lines.push(format!(
                "- [{}]({}) ref `{}`, {} ({} {:.2}), keyword `{}`",
                record.title(),
                record.url(),
                record.reference_number(),
                record.get(Column::IssuingAuthority),
                listing.label.arabic(),
                listing.score,
                listing.keyword
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

async fn export_parquet_snapshot(run_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let listings_path = snapshot_dir.join("listings.parquet");
    write_listings_parquet(&listings_path, report)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("listings", run_dir, &listings_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_listings_parquet(path: &Path, report: &RunReport) -> Result<()> {
    let rows: Vec<(&str, &ScoredListing)> = report
        .sources
        .iter()
        .flat_map(|s| s.listings.iter().map(move |l| (s.source_id.as_str(), l)))
        .collect();

    let mut fields = vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("keyword", DataType::Utf8, false),
    ];
    fields.extend(
        Column::ALL
            .iter()
            .map(|c| ArrowField::new(c.to_string(), DataType::Utf8, false)),
    );
    fields.push(ArrowField::new("identity_key", DataType::Utf8, false));
    fields.push(ArrowField::new("relevance_score", DataType::Float64, false));
    fields.push(ArrowField::new("relevance_label", DataType::Utf8, false));
    let schema = Arc::new(Schema::new(fields));

    let mut columns: Vec<Arc<dyn arrow_array::Array>> = vec![
        Arc::new(StringArray::from(rows.iter().map(|(s, _)| *s).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            rows.iter().map(|(_, l)| l.keyword.as_str()).collect::<Vec<_>>(),
        )),
    ];
    for column in Column::ALL {
        columns.push(Arc::new(StringArray::from(
            rows.iter().map(|(_, l)| l.record.get(column)).collect::<Vec<_>>(),
        )));
    }
    columns.push(Arc::new(StringArray::from(
        rows.iter()
            .map(|(_, l)| l.record.identity_key().to_string())
            .collect::<Vec<_>>(),
    )));
    columns.push(Arc::new(Float64Array::from(
        rows.iter().map(|(_, l)| l.score).collect::<Vec<_>>(),
    )));
    columns.push(Arc::new(StringArray::from(
        rows.iter().map(|(_, l)| l.label.arabic()).collect::<Vec<_>>(),
    )));

    let batch = RecordBatch::try_new(schema, columns).context("building listings record batch")?;
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::KeywordStatus;
    use otw_core::{ListingRecord, RawFields, RelevanceLabel};

    fn keyword_report(keyword: &str, accepted: usize) -> KeywordReport {
        KeywordReport {
            keyword: keyword.into(),
            search_url: format!("https://portal.etimad.sa/search?q={keyword}"),
            status: KeywordStatus::Searched,
            card_selector: Some("div.card-body".into()),
            cards_found: 3,
            accepted,
            incomplete: 0,
            not_today: 1,
            duplicates: 0,
            capped: false,
            error: None,
        }
    }

    fn report(listings: Vec<ScoredListing>) -> RunReport {
        RunReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            dry_run: true,
            sources: vec![SourceRunReport {
                source_id: "etimad".into(),
                display_name: "Etimad".into(),
                keywords: vec![keyword_report("هاكاثون", listings.len())],
                listings,
                commit: CommitStatus::DryRun,
                sheet: None,
                pending_batch: None,
                error: None,
            }],
        }
    }

    fn scored(reference: &str) -> ScoredListing {
        let record = ListingRecord::from_fields(
            &RawFields::new()
                .with(Column::ReferenceNumber, reference)
                .with(Column::Title, "تنظيم هاكاثون")
                .with(Column::Url, "https://portal.etimad.sa/t/1")
                .with(Column::IssuingAuthority, "هيئة الحكومة الرقمية"),
        )
        .unwrap();
        ScoredListing {
            keyword: "هاكاثون".into(),
            record,
            score: 0.82,
            label: RelevanceLabel::High,
        }
    }

    #[test]
    fn empty_run_says_no_results_today() {
        let brief = daily_brief_markdown(&report(vec![]));
        assert!(brief.contains("No results today."));
        assert!(brief.contains(NO_RESULTS_AR));
        assert!(brief.contains("not touched (dry run)"));
    }

    #[test]
    fn brief_lists_accepted_listings_with_labels() {
        let brief = daily_brief_markdown(&report(vec![scored("R1")]));
        assert!(brief.contains("[تنظيم هاكاثون](https://portal.etimad.sa/t/1) ref `R1`"));
        assert!(brief.contains("مرتفع 0.82"));
        assert!(brief.contains("| هاكاثون | Searched | 3 | 1 | 1 | 0 |"));
    }

    #[tokio::test]
    async fn report_directory_has_brief_delta_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let report = report(vec![scored("R1"), scored("R2")]);
        let run_dir = write_run_report(dir.path(), &report).await.unwrap();

        assert_eq!(run_dir, dir.path().join(report.run_id.to_string()));
        assert!(run_dir.join("daily_brief.md").exists());
        let delta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(run_dir.join("listings_delta.json")).unwrap()).unwrap();
        assert_eq!(delta["sources"][0]["listings"].as_array().unwrap().len(), 2);
        assert_eq!(delta["sources"][0]["commit"], "dry_run");

        let manifest: serde_json::Value = serde_json::from_slice(
            &std::fs::read(run_dir.join("snapshots/manifest.json")).unwrap(),
        )
        .unwrap();
        let entry = &manifest["files"][0];
        assert_eq!(entry["path"], "snapshots/listings.parquet");
        let parquet_bytes = std::fs::read(run_dir.join("snapshots/listings.parquet")).unwrap();
        assert_eq!(entry["sha256"], hex::encode(Sha256::digest(&parquet_bytes)));
        assert_eq!(&parquet_bytes[..4], b"PAR1");
    }
}
