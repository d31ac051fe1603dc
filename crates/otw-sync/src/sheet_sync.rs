use std::collections::HashSet;

use otw_core::{Column, ColumnSet, IdentityKey, ListingRecord};
use otw_storage::{SheetError, SheetStore};
use serde::Serialize;
use tracing::{info, warn};

/// Extra key re-reads allowed when another writer appends mid-sync.
const OPTIMISTIC_RETRIES: usize = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SheetSyncOutcome {
    pub header_repaired: bool,
    pub existing_keys: usize,
    pub appended: usize,
    pub skipped: usize,
}

/// Append the records the store does not already hold, in order.
///
/// The header row is repaired first when it differs from `columns`. Records
/// whose identity is already in the sheet (or repeated earlier in the batch)
/// are skipped: rows with a reference number match on it, rows without one on
/// title and url. The key set is read again right before the append; if it
/// grew the batch is filtered again.
pub async fn sync_to_sheet(
    store: &dyn SheetStore,
    columns: &ColumnSet,
    records: &[ListingRecord],
) -> Result<SheetSyncOutcome, SheetError> {
    let mut outcome = SheetSyncOutcome::default();

    let header = store.get_header().await?;
    if !columns.matches_header(&header) {
        warn!(found = ?header, "sheet header differs from configured columns; rewriting");
        store.set_header(columns.names()).await?;
        outcome.header_repaired = true;
    }

    let mut existing = read_existing_keys(store).await?;
    let mut pending = unseen_records(records, &existing);

    for attempt in 0..=OPTIMISTIC_RETRIES {
        let fresh = read_existing_keys(store).await?;
        if fresh.is_subset(&existing) {
            break;
        }
        warn!(
            attempt,
            before = existing.len(),
            after = fresh.len(),
            "sheet changed during sync; filtering again"
        );
        existing.extend(fresh);
        pending = unseen_records(records, &existing);
    }
    outcome.existing_keys = existing.len();

    let rows: Vec<Vec<String>> = pending.iter().map(|r| r.to_row()).collect();
    if !rows.is_empty() {
        store.append_rows(&rows).await?;
    }
    outcome.appended = rows.len();
    outcome.skipped = records.len() - rows.len();

    info!(
        appended = outcome.appended,
        skipped = outcome.skipped,
        existing = outcome.existing_keys,
        header_repaired = outcome.header_repaired,
        "sheet sync finished"
    );
    Ok(outcome)
}

/// Identity keys of every data row. The header equals the configured
/// columns by now, so cells sit at their canonical positions.
async fn read_existing_keys(store: &dyn SheetStore) -> Result<HashSet<IdentityKey>, SheetError> {
    let rows = store.get_all_rows().await?;
    Ok(rows.iter().skip(1).filter_map(|row| row_identity(row)).collect())
}

fn row_identity(row: &[String]) -> Option<IdentityKey> {
    let cell = |column: Column| row.get(column.position()).map(|c| c.trim()).unwrap_or("");
    let reference = cell(Column::ReferenceNumber);
    if !reference.is_empty() {
        return Some(IdentityKey::Reference(reference.to_string()));
    }
    let (title, url) = (cell(Column::Title), cell(Column::Url));
    if title.is_empty() || url.is_empty() {
        return None;
    }
    Some(IdentityKey::Untracked {
        title: title.to_string(),
        url: url.to_string(),
    })
}

fn unseen_records<'r>(
    records: &'r [ListingRecord],
    existing: &HashSet<IdentityKey>,
) -> Vec<&'r ListingRecord> {
    let mut batch_keys: HashSet<IdentityKey> = HashSet::new();
    records
        .iter()
        .filter(|record| {
            let key = record.identity_key();
            !existing.contains(&key) && batch_keys.insert(key)
        })
        .collect()
}
