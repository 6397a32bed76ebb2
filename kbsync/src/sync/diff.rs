use std::collections::{BTreeSet, HashMap, HashSet};

use super::enumerate::SourceFileRecord;
use super::ledger::LedgerEntry;

/// Source timestamps further ahead of the local clock than this are not trusted.
pub const CLOCK_SKEW_TOLERANCE_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    pub to_create: BTreeSet<String>,
    pub to_update: BTreeSet<String>,
    pub to_delete: BTreeSet<String>,
    pub unchanged: BTreeSet<String>,
}

impl DiffResult {
    pub fn is_noop(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

pub fn compute_diff(
    records: &[SourceFileRecord],
    ledger: &HashMap<String, LedgerEntry>,
    now_ms: i64,
) -> DiffResult {
    let mut diff = DiffResult::default();
    let mut seen = HashSet::new();

    for record in records.iter().filter(|record| !record.is_folder) {
        if !seen.insert(record.id.as_str()) {
            continue;
        }
        match ledger.get(&record.id) {
            None => {
                diff.to_create.insert(record.id.clone());
            }
            Some(entry) if is_modified(record.modified_at, entry.last_synced_modified_at, now_ms) => {
                diff.to_update.insert(record.id.clone());
            }
            Some(_) => {
                diff.unchanged.insert(record.id.clone());
            }
        }
    }

    for source_id in ledger.keys() {
        if !seen.contains(source_id.as_str()) {
            diff.to_delete.insert(source_id.clone());
        }
    }

    diff
}

fn is_modified(current: Option<i64>, synced: Option<i64>, now_ms: i64) -> bool {
    match (current, synced) {
        (Some(current), Some(synced)) => {
            current > now_ms.saturating_add(CLOCK_SKEW_TOLERANCE_MS) || current > synced
        }
        _ => true,
    }
}
