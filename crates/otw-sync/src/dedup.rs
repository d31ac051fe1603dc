use std::collections::HashSet;

use otw_core::{IdentityKey, ListingRecord};

/// Identity keys accepted so far in one run.
///
/// Owned by the merge step of a single run and dropped with it; nothing
/// outlives the invocation.
#[derive(Debug, Default)]
pub struct SeenSet {
    keys: HashSet<IdentityKey>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, record: &ListingRecord) -> bool {
        self.keys.contains(&record.identity_key())
    }

    /// Records the key; returns `false` when it was already present.
    pub fn insert(&mut self, record: &ListingRecord) -> bool {
        self.keys.insert(record.identity_key())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Keep the first occurrence of every identity key, preserving order.
pub fn first_occurrences(records: impl IntoIterator<Item = ListingRecord>) -> Vec<ListingRecord> {
    let mut seen = SeenSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record))
        .collect()
}
