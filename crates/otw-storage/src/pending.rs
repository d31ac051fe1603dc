use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use otw_core::ListingRecord;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::write_atomically;

/// Records computed by one run that have not yet been committed to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingBatch {
    pub run_id: Uuid,
    pub source_id: String,
    pub created_at: DateTime<Utc>,
    pub records: Vec<ListingRecord>,
}

/// Directory of pending batches, one JSON file per run.
///
/// A batch is written before the store commit and removed after it succeeds,
/// so a failed commit can be replayed without scraping again.
#[derive(Debug, Clone)]
pub struct PendingBatchStore {
    dir: PathBuf,
}

impl PendingBatchStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, batch: &PendingBatch) -> PathBuf {
        let stamp = batch.created_at.format("%Y%m%dT%H%M%S");
        self.dir.join(format!("{stamp}_{}.json", batch.run_id))
    }

    pub async fn save(&self, batch: &PendingBatch) -> anyhow::Result<PathBuf> {
        let path = self.path_for(batch);
        let bytes = serde_json::to_vec_pretty(batch).context("serializing pending batch")?;
        write_atomically(&path, &bytes).await?;
        Ok(path)
    }

    /// Pending batch files, oldest first.
    pub async fn list(&self) -> anyhow::Result<Vec<PathBuf>> {
        if !fs::try_exists(&self.dir)
            .await
            .with_context(|| format!("checking {}", self.dir.display()))?
        {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("reading {}", self.dir.display()))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_batch = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if is_batch {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub async fn load(&self, path: &Path) -> anyhow::Result<PendingBatch> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub async fn remove(&self, path: &Path) -> anyhow::Result<()> {
        fs::remove_file(path)
            .await
            .with_context(|| format!("removing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use otw_core::{Column, RawFields};
    use tempfile::tempdir;

    fn batch(hour: u32, reference: &str) -> PendingBatch {
        let record = ListingRecord::from_fields(
            &RawFields::new()
                .with(Column::ReferenceNumber, reference)
                .with(Column::Title, "منافسة تنظيم فعالية")
                .with(Column::Url, "https://portal.etimad.sa/t/1"),
        )
        .unwrap();
        PendingBatch {
            run_id: Uuid::new_v4(),
            source_id: "etimad".into(),
            created_at: Utc.with_ymd_and_hms(2026, 10, 19, hour, 0, 0).single().unwrap(),
            records: vec![record],
        }
    }

    #[tokio::test]
    async fn missing_dir_lists_nothing() {
        let dir = tempdir().unwrap();
        let store = PendingBatchStore::new(dir.path().join("pending"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batches_survive_round_trip_in_age_order() {
        let dir = tempdir().unwrap();
        let store = PendingBatchStore::new(dir.path());
        let later = batch(18, "R2");
        let earlier = batch(6, "R1");
        store.save(&later).await.unwrap();
        store.save(&earlier).await.unwrap();

        let paths = store.list().await.unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(store.load(&paths[0]).await.unwrap(), earlier);
        assert_eq!(store.load(&paths[1]).await.unwrap(), later);

        store.remove(&paths[0]).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![paths[1].clone()]);
    }
}
