//! Conflict detection and arbitration.
//!
//! A row is in conflict when both systems changed it since the last sync in
//! the opposite direction AND the changed column sets overlap. Disjoint
//! column edits merge cleanly and never reach the resolver.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ConflictPolicy;
use crate::detect::{row_key, ChangeSet};
use crate::target::{ChangeLogEntry, ChangeOp};
use crate::value::Row;

/// A concurrently edited row, with both observed versions.
#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    pub row_key: String,
    pub sheet_row: Row,
    pub table_row: Row,
    pub sheet_changed_at: DateTime<Utc>,
    pub table_changed_at: DateTime<Utc>,
    /// The overlapping changed columns that made this a conflict.
    pub columns: Vec<String>,
}

/// Which side a resolved conflict kept. `Manual` means unresolved: the
/// conflict is persisted and neither side is written this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictWinner {
    Sheet,
    Table,
    Manual,
}

impl ConflictWinner {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictWinner::Sheet => "sheet",
            ConflictWinner::Table => "table",
            ConflictWinner::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<ConflictWinner> {
        match s {
            "sheet" => Some(ConflictWinner::Sheet),
            "table" => Some(ConflictWinner::Table),
            "manual" => Some(ConflictWinner::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub winner: ConflictWinner,
    pub resolved_value: Option<Row>,
}

/// Find the rows of `changes` that also changed table-side since the last
/// Table→Spreadsheet sync.
///
/// `table_changes` are change-log entries already filtered of `from_sheet`
/// writes; entries at or before `last_db_sync_at` are ignored (they were
/// propagated by an earlier cycle). When several entries touch one key the
/// latest wins. `sheet_changed_at` is the spreadsheet-side logical change
/// timestamp; callers pass "now" when the API exposes none.
pub fn detect_conflicts(
    changes: &ChangeSet,
    table_changes: &[ChangeLogEntry],
    sheet_changed_at: DateTime<Utc>,
    last_db_sync_at: Option<DateTime<Utc>>,
    pk_column: &str,
) -> Vec<Conflict> {
    let mut latest_by_key: Vec<(String, &ChangeLogEntry)> = Vec::new();
    for entry in table_changes {
        if let Some(since) = last_db_sync_at {
            if entry.changed_at <= since {
                continue;
            }
        }
        let Some(key) = row_key(&entry.row, pk_column) else {
            continue;
        };
        // Entries arrive in id order; the last one per key is the current
        // table-side state.
        if let Some(slot) = latest_by_key.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = entry;
        } else {
            latest_by_key.push((key, entry));
        }
    }

    let mut conflicts = Vec::new();

    for update in &changes.updates {
        let Some(entry) = latest_by_key
            .iter()
            .find(|(k, _)| *k == update.key)
            .map(|(_, e)| *e)
        else {
            continue;
        };
        let overlap = overlap_columns(&update.changed_columns, entry, pk_column);
        if overlap.is_empty() {
            continue;
        }
        conflicts.push(Conflict {
            row_key: update.key.clone(),
            sheet_row: update.row.clone(),
            table_row: entry.row.clone(),
            sheet_changed_at,
            table_changed_at: entry.changed_at,
            columns: overlap,
        });
    }

    // A sheet-side insert can collide with a table-side write to the same
    // key (e.g. both systems created the row independently).
    for insert in &changes.inserts {
        let Some(key) = row_key(insert, pk_column) else {
            continue;
        };
        let Some(entry) = latest_by_key
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, e)| *e)
        else {
            continue;
        };
        let sheet_columns: Vec<String> = insert
            .keys()
            .filter(|c| c.as_str() != pk_column)
            .cloned()
            .collect();
        let overlap = overlap_columns(&sheet_columns, entry, pk_column);
        if overlap.is_empty() {
            continue;
        }
        conflicts.push(Conflict {
            row_key: key,
            sheet_row: insert.clone(),
            table_row: entry.row.clone(),
            sheet_changed_at,
            table_changed_at: entry.changed_at,
            columns: overlap,
        });
    }

    conflicts
}

/// Intersect the sheet-side changed columns with the columns the change-log
/// entry touched. INSERT/UPDATE snapshots carry every mapped column; DELETE
/// carries only the primary key and is treated as touching everything.
fn overlap_columns(
    sheet_columns: &[String],
    entry: &ChangeLogEntry,
    pk_column: &str,
) -> Vec<String> {
    if entry.op == ChangeOp::Delete {
        return sheet_columns.to_vec();
    }
    let table_columns: HashSet<&String> =
        entry.row.keys().filter(|c| c.as_str() != pk_column).collect();
    sheet_columns
        .iter()
        .filter(|c| table_columns.contains(c))
        .cloned()
        .collect()
}

/// Arbitrate one conflict under the configured policy.
pub fn resolve(policy: ConflictPolicy, conflict: &Conflict) -> Resolution {
    let winner = match policy {
        // Later change wins; a tie goes to the spreadsheet.
        ConflictPolicy::LastWriteWins => {
            if conflict.sheet_changed_at >= conflict.table_changed_at {
                ConflictWinner::Sheet
            } else {
                ConflictWinner::Table
            }
        }
        ConflictPolicy::SpreadsheetWins => ConflictWinner::Sheet,
        ConflictPolicy::TableWins => ConflictWinner::Table,
        ConflictPolicy::Manual => ConflictWinner::Manual,
    };

    let resolved_value = match winner {
        ConflictWinner::Sheet => Some(conflict.sheet_row.clone()),
        ConflictWinner::Table => Some(conflict.table_row.clone()),
        ConflictWinner::Manual => None,
    };

    Resolution {
        winner,
        resolved_value,
    }
}

/// Rewrite the Spreadsheet→Table change set according to the resolutions.
///
/// Sheet winners stay in the change set; table and manual winners drop their
/// row so the table value survives the cycle (for table winners a later
/// Table→Spreadsheet run propagates it back to the sheet).
pub fn apply_resolutions(
    mut changes: ChangeSet,
    resolutions: &[(Conflict, Resolution)],
    pk_column: &str,
) -> ChangeSet {
    let dropped: HashSet<&str> = resolutions
        .iter()
        .filter(|(_, r)| r.winner != ConflictWinner::Sheet)
        .map(|(c, _)| c.row_key.as_str())
        .collect();

    if dropped.is_empty() {
        return changes;
    }

    changes
        .inserts
        .retain(|row| match row_key(row, pk_column) {
            Some(key) => !dropped.contains(key.as_str()),
            None => false,
        });
    changes.updates.retain(|u| !dropped.contains(u.key.as_str()));

    changes
}
