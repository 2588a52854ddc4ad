//! Per-year download planning
//!
//! [`plan`] is a pure function of the listing, a ledger snapshot, the load
//! mode and the sample cap. It reads no clock and no randomness, so identical
//! inputs serialize to identical plans.

use std::collections::HashSet;

use crate::app::ledger::LedgerSnapshot;
use crate::app::models::{IngestionRecord, LoadMode, RemoteEntry, RemoteListing, SyncPlan};

/// Compute the files to download for one year
///
/// - Historical: entries with no record or a record that is not committed.
/// - Incremental: additionally entries whose committed record has a different
///   size or modification time than the listing. Values missing on either
///   side are not compared.
///
/// Duplicate listing entries collapse onto their first occurrence. The sample
/// cap keeps the first `k` selected entries in listing order.
pub fn plan(
    listing: &RemoteListing,
    ledger: &LedgerSnapshot,
    mode: LoadMode,
    sample_cap: Option<usize>,
) -> SyncPlan {
    let mut seen = HashSet::new();
    let mut selected = Vec::new();
    let mut skipped_count = 0;

    for entry in &listing.entries {
        if !seen.insert(entry.file_id()) {
            continue;
        }
        if is_selected(entry, ledger.get(entry.file_id()), mode) {
            selected.push(entry.clone());
        } else {
            skipped_count += 1;
        }
    }

    let deferred_count = match sample_cap {
        Some(cap) if selected.len() > cap => {
            let deferred = selected.len() - cap;
            selected.truncate(cap);
            deferred
        }
        _ => 0,
    };

    SyncPlan {
        year: listing.year,
        mode,
        to_download: selected,
        skipped_count,
        deferred_count,
    }
}

fn is_selected(entry: &RemoteEntry, record: Option<&IngestionRecord>, mode: LoadMode) -> bool {
    let Some(record) = record else {
        return true;
    };
    if !record.is_committed() {
        return true;
    }
    match mode {
        LoadMode::Historical => false,
        LoadMode::Incremental => record.metadata_changed(entry),
    }
}
