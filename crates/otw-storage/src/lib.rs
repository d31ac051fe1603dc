//! Fetching, on-disk artifacts and the spreadsheet store for OTW.

mod archive;
mod http;
mod pending;
mod sheets;

pub use archive::{ArchivedPage, PageArchive};
pub use http::{
    classify_reqwest_error, BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, PageSource, RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
    DEFAULT_USER_AGENT,
};
pub use pending::{PendingBatch, PendingBatchStore};
pub use sheets::{
    GoogleSheetsConfig, GoogleSheetsStore, InMemorySheet, SheetError, SheetStore, SHEETS_API_BASE,
};

pub const CRATE_NAME: &str = "otw-storage";

/// Write `bytes` to `path` through a sibling temp file and a rename, so
/// readers never observe a partial file.
pub(crate) async fn write_atomically(path: &std::path::Path, bytes: &[u8]) -> anyhow::Result<()> {
    use anyhow::Context;
    use tokio::io::AsyncWriteExt;

    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", uuid::Uuid::new_v4(), bytes.len()));
    let mut file = tokio::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}
