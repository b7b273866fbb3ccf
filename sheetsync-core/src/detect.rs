//! Change detection: keyed diff of two row sets.
//!
//! Keys are the trimmed string form of the primary-key cell, so a numeric id
//! in the table still matches the text id the spreadsheet hands back.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::warn;

use crate::value::Row;

/// An update produced by change detection: the full current row plus which
/// columns actually differ from the baseline.
#[derive(Debug, Clone, Serialize)]
pub struct RowUpdate {
    pub key: String,
    pub row: Row,
    pub changed_columns: Vec<String>,
}

/// The result of diffing `current` against `baseline`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeSet {
    pub inserts: Vec<Row>,
    pub updates: Vec<RowUpdate>,
    /// Primary keys present in the baseline but absent from current.
    pub deletes: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }
}

/// Extract the diff key for a row, if it has a usable primary key.
pub fn row_key(row: &Row, pk_column: &str) -> Option<String> {
    let value = row.get(pk_column)?;
    if value.is_empty() {
        return None;
    }
    Some(value.display_string().trim().to_string())
}

/// Diff `current` against `baseline` keyed by `pk_column`.
///
/// Rows whose key is missing, null or empty are skipped with a warning.
/// Output ordering follows the iteration order of `current` (inserts and
/// updates) and `baseline` (deletes).
pub fn detect_changes(
    current: &[Row],
    baseline: &[Row],
    pk_column: &str,
    ignore_columns: &HashSet<String>,
) -> ChangeSet {
    let mut baseline_by_key: HashMap<String, &Row> = HashMap::new();
    for row in baseline {
        match row_key(row, pk_column) {
            Some(key) => {
                baseline_by_key.insert(key, row);
            }
            None => warn!(pk_column, "baseline row has no usable primary key, skipping"),
        }
    }

    let mut changes = ChangeSet::default();
    let mut seen: HashSet<String> = HashSet::new();

    for row in current {
        let key = match row_key(row, pk_column) {
            Some(key) => key,
            None => {
                warn!(pk_column, "current row has no usable primary key, skipping");
                continue;
            }
        };
        seen.insert(key.clone());

        match baseline_by_key.get(&key) {
            None => changes.inserts.push(row.clone()),
            Some(base) => {
                let changed = changed_columns(row, base, ignore_columns);
                if !changed.is_empty() {
                    changes.updates.push(RowUpdate {
                        key,
                        row: row.clone(),
                        changed_columns: changed,
                    });
                }
            }
        }
    }

    for row in baseline {
        if let Some(key) = row_key(row, pk_column) {
            if !seen.contains(&key) {
                changes.deletes.push(key);
            }
        }
    }

    changes
}

/// Columns whose values differ between the two rows, ignoring `ignore`.
/// Considers the union of both rows' columns so a column dropped on one side
/// still counts as changed.
fn changed_columns(a: &Row, b: &Row, ignore: &HashSet<String>) -> Vec<String> {
    let mut columns: Vec<&String> = a.keys().chain(b.keys()).collect();
    columns.sort();
    columns.dedup();

    columns
        .into_iter()
        .filter(|c| !ignore.contains(*c))
        .filter(|c| {
            let left = a.get(*c);
            let right = b.get(*c);
            match (left, right) {
                (Some(l), Some(r)) => !l.loosely_eq(r),
                (Some(v), None) | (None, Some(v)) => !v.is_empty(),
                (None, None) => false,
            }
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::CellValue;

    fn row(pairs: &[(&str, CellValue)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn user(id: i64, name: &str) -> Row {
        row(&[
            ("id", CellValue::Int(id)),
            ("name", CellValue::Text(name.into())),
        ])
    }

    #[test]
    fn disjoint_key_sets_split_into_inserts_and_deletes() {
        let current = vec![user(1, "Alice"), user(2, "Bob")];
        let baseline = vec![user(3, "Carol")];

        let changes = detect_changes(&current, &baseline, "id", &HashSet::new());
        assert_eq!(changes.inserts.len(), 2);
        assert_eq!(changes.updates.len(), 0);
        assert_eq!(changes.deletes, vec!["3".to_string()]);
    }

    #[test]
    fn update_reports_changed_columns_only() {
        let current = vec![row(&[
            ("id", CellValue::Int(1)),
            ("name", CellValue::Text("Alicia".into())),
            ("email", CellValue::Text("alice@x".into())),
        ])];
        let baseline = vec![row(&[
            ("id", CellValue::Int(1)),
            ("name", CellValue::Text("Alice".into())),
            ("email", CellValue::Text("alice@x".into())),
        ])];

        let changes = detect_changes(&current, &baseline, "id", &HashSet::new());
        assert!(changes.inserts.is_empty());
        assert!(changes.deletes.is_empty());
        assert_eq!(changes.updates.len(), 1);
        assert_eq!(changes.updates[0].key, "1");
        assert_eq!(changes.updates[0].changed_columns, vec!["name".to_string()]);
    }

    #[test]
    fn type_laundered_values_do_not_diff() {
        // Table has Int(1), sheet hands back Text("1"). No change.
        let current = vec![row(&[
            ("id", CellValue::Text("1".into())),
            ("name", CellValue::Text("Alice".into())),
        ])];
        let baseline = vec![user(1, "Alice")];

        let changes = detect_changes(&current, &baseline, "id", &HashSet::new());
        assert!(changes.is_empty());
    }

    #[test]
    fn numeric_and_string_keys_unify() {
        // Numeric-vs-string primary key mismatch must not produce an
        // insert/delete pair.
        let current = vec![row(&[
            ("id", CellValue::Text(" 7 ".into())),
            ("name", CellValue::Text("Eve".into())),
        ])];
        let baseline = vec![user(7, "Eve")];

        assert!(detect_changes(&current, &baseline, "id", &HashSet::new()).is_empty());
    }

    #[test]
    fn rows_without_primary_key_are_skipped() {
        let current = vec![
            row(&[("name", CellValue::Text("NoKey".into()))]),
            row(&[("id", CellValue::Null), ("name", CellValue::Text("Null".into()))]),
            user(1, "Alice"),
        ];

        let changes = detect_changes(&current, &[], "id", &HashSet::new());
        assert_eq!(changes.inserts.len(), 1);
    }

    #[test]
    fn ignored_columns_do_not_trigger_updates() {
        let mut ignore = HashSet::new();
        ignore.insert("updated_at".to_string());

        let current = vec![row(&[
            ("id", CellValue::Int(1)),
            ("updated_at", CellValue::Text("2026-01-02".into())),
        ])];
        let baseline = vec![row(&[
            ("id", CellValue::Int(1)),
            ("updated_at", CellValue::Text("2026-01-01".into())),
        ])];

        assert!(detect_changes(&current, &baseline, "id", &ignore).is_empty());
    }

    #[test]
    fn empty_inputs() {
        assert!(detect_changes(&[], &[], "id", &HashSet::new()).is_empty());
    }
}
