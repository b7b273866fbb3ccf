//! Sync configuration: the declarative mapping between one spreadsheet range
//! and one target table, plus the engine tuning knobs.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::value::{CellValue, Row};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config field '{0}' must not be empty")]
    EmptyField(&'static str),
    #[error("column mapping is empty")]
    EmptyMapping,
    #[error("column mapping key '{0}' is not a single letter A-Z")]
    BadLetter(String),
    #[error("column mapping letters must be contiguous starting at A (missing '{0}')")]
    NonContiguous(char),
    #[error("column mapping maps '{0}' to an empty column name")]
    EmptyColumn(char),
    #[error("column '{0}' appears more than once in the mapping")]
    DuplicateColumn(String),
    #[error("sync interval must be at least 1 second")]
    BadInterval,
}

/// Ordered mapping from spreadsheet column letters (A, B, ...) to target-table
/// column names. The letter-A column is the primary key.
///
/// Serializes as a plain `{ "A": "id", "B": "name" }` map; construction
/// validates that letters are unique, contiguous and start at A.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct ColumnMapping {
    columns: Vec<(char, String)>,
}

impl ColumnMapping {
    pub fn new(pairs: Vec<(char, String)>) -> Result<Self, ConfigError> {
        if pairs.is_empty() {
            return Err(ConfigError::EmptyMapping);
        }
        let mut seen = HashSet::new();
        for (i, (letter, column)) in pairs.iter().enumerate() {
            let expected = (b'A' + i as u8) as char;
            if !letter.is_ascii_uppercase() {
                return Err(ConfigError::BadLetter(letter.to_string()));
            }
            if *letter != expected {
                return Err(ConfigError::NonContiguous(expected));
            }
            if column.trim().is_empty() {
                return Err(ConfigError::EmptyColumn(*letter));
            }
            if !seen.insert(column.clone()) {
                return Err(ConfigError::DuplicateColumn(column.clone()));
            }
        }
        Ok(ColumnMapping { columns: pairs })
    }

    /// The target column the letter-A cell maps to.
    pub fn primary_key_column(&self) -> &str {
        &self.columns[0].1
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Mapped target column names, in letter order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(_, c)| c.as_str())
    }

    pub fn column_for_letter(&self, letter: char) -> Option<&str> {
        self.columns
            .iter()
            .find(|(l, _)| *l == letter)
            .map(|(_, c)| c.as_str())
    }

    pub fn letter_for_column(&self, column: &str) -> Option<char> {
        self.columns
            .iter()
            .find(|(_, c)| c == column)
            .map(|(l, _)| *l)
    }

    /// Project a 2-D cell grid into rows keyed by target column name.
    ///
    /// Row 0 is treated as headers and skipped. Cells beyond the mapping are
    /// ignored; missing trailing cells become NULL. Rows with a missing or
    /// empty primary-key cell are skipped with a warning and counted.
    pub fn project_grid(&self, grid: &[Vec<CellValue>]) -> ProjectedRows {
        let mut rows = Vec::new();
        let mut skipped = 0usize;

        for (i, cells) in grid.iter().enumerate().skip(1) {
            let mut row = Row::new();
            for (idx, (_, column)) in self.columns.iter().enumerate() {
                let value = cells.get(idx).cloned().unwrap_or(CellValue::Null);
                row.insert(column.clone(), value);
            }
            let pk = row.get(self.primary_key_column());
            if pk.map(|v| v.is_empty()).unwrap_or(true) {
                // Cleared rows show up as all-empty cells; don't warn on those.
                if cells.iter().any(|c| !c.is_empty()) {
                    warn!(sheet_row = i + 1, "skipping row with missing primary key");
                    skipped += 1;
                }
                continue;
            }
            rows.push(row);
        }

        ProjectedRows { rows, skipped }
    }

    /// Flatten a row into cells in mapping (letter) order.
    pub fn row_to_cells(&self, row: &Row) -> Vec<CellValue> {
        self.columns
            .iter()
            .map(|(_, column)| row.get(column).cloned().unwrap_or(CellValue::Null))
            .collect()
    }
}

/// Outcome of grid projection: the usable rows plus how many were skipped
/// over data problems.
#[derive(Debug)]
pub struct ProjectedRows {
    pub rows: Vec<Row>,
    pub skipped: usize,
}

impl TryFrom<BTreeMap<String, String>> for ColumnMapping {
    type Error = ConfigError;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut pairs = Vec::with_capacity(map.len());
        for (key, column) in map {
            let mut chars = key.trim().chars();
            let letter = match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphabetic() => c.to_ascii_uppercase(),
                _ => return Err(ConfigError::BadLetter(key)),
            };
            pairs.push((letter, column));
        }
        pairs.sort_by_key(|(l, _)| *l);
        ColumnMapping::new(pairs)
    }
}

impl From<ColumnMapping> for BTreeMap<String, String> {
    fn from(mapping: ColumnMapping) -> Self {
        mapping
            .columns
            .into_iter()
            .map(|(l, c)| (l.to_string(), c))
            .collect()
    }
}

/// How concurrent edits to the same row are arbitrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    LastWriteWins,
    SpreadsheetWins,
    TableWins,
    Manual,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::LastWriteWins => "last-write-wins",
            ConflictPolicy::SpreadsheetWins => "spreadsheet-wins",
            ConflictPolicy::TableWins => "table-wins",
            ConflictPolicy::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<ConflictPolicy> {
        match s {
            "last-write-wins" => Some(ConflictPolicy::LastWriteWins),
            "spreadsheet-wins" => Some(ConflictPolicy::SpreadsheetWins),
            "table-wins" => Some(ConflictPolicy::TableWins),
            "manual" => Some(ConflictPolicy::Manual),
            _ => None,
        }
    }
}

/// One spreadsheet range kept in sync with one target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub id: String,
    pub name: String,
    pub spreadsheet_id: String,
    /// A1-style range; defaults to the first sheet.
    #[serde(default = "default_range")]
    pub range: String,
    /// Connection URL of the database holding the target table.
    pub target_db_url: String,
    pub target_table: String,
    pub mapping: ColumnMapping,
    #[serde(default = "default_policy")]
    pub conflict_policy: ConflictPolicy,
    #[serde(default = "default_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_range() -> String {
    "Sheet1".to_string()
}

fn default_policy() -> ConflictPolicy {
    ConflictPolicy::LastWriteWins
}

fn default_interval() -> u64 {
    60
}

fn default_active() -> bool {
    true
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::EmptyField("id"));
        }
        if self.spreadsheet_id.trim().is_empty() {
            return Err(ConfigError::EmptyField("spreadsheet_id"));
        }
        if self.target_db_url.trim().is_empty() {
            return Err(ConfigError::EmptyField("target_db_url"));
        }
        if self.target_table.trim().is_empty() {
            return Err(ConfigError::EmptyField("target_table"));
        }
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::BadInterval);
        }
        // The mapping re-validates on construction; nothing further here.
        Ok(())
    }
}

/// Process-wide engine tuning. Constructed at startup and passed through the
/// engine context; there is no module-level state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Orchestrator tick interval.
    pub tick_interval_secs: u64,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: bool,
    /// Change-log scan limit per Table→Spreadsheet run.
    pub change_log_batch: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            tick_interval_secs: 10,
            max_retry_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            retry_jitter: true,
            change_log_batch: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> ColumnMapping {
        ColumnMapping::new(vec![
            ('A', "id".into()),
            ('B', "name".into()),
            ('C', "email".into()),
        ])
        .expect("valid mapping")
    }

    #[test]
    fn mapping_from_json_map() {
        let m: ColumnMapping =
            serde_json::from_value(serde_json::json!({"A": "id", "B": "name"})).expect("parse");
        assert_eq!(m.primary_key_column(), "id");
        assert_eq!(m.width(), 2);
        assert_eq!(m.column_for_letter('B'), Some("name"));
        assert_eq!(m.letter_for_column("name"), Some('B'));
    }

    #[test]
    fn mapping_rejects_gap() {
        let err = serde_json::from_value::<ColumnMapping>(serde_json::json!({"A": "id", "C": "x"}))
            .unwrap_err();
        assert!(err.to_string().contains("contiguous"));
    }

    #[test]
    fn mapping_rejects_missing_a() {
        assert!(
            serde_json::from_value::<ColumnMapping>(serde_json::json!({"B": "name"})).is_err()
        );
    }

    #[test]
    fn mapping_rejects_duplicate_column() {
        assert!(
            serde_json::from_value::<ColumnMapping>(serde_json::json!({"A": "id", "B": "id"}))
                .is_err()
        );
    }

    #[test]
    fn projection_skips_header_and_missing_pk() {
        let grid = vec![
            vec![
                CellValue::Text("id".into()),
                CellValue::Text("name".into()),
                CellValue::Text("email".into()),
            ],
            vec![
                CellValue::Text("1".into()),
                CellValue::Text("Alice".into()),
                CellValue::Text("alice@x".into()),
            ],
            // Missing primary key: skipped (and counted).
            vec![
                CellValue::Null,
                CellValue::Text("Ghost".into()),
                CellValue::Null,
            ],
            // Cleared row: skipped silently.
            vec![CellValue::Null, CellValue::Null, CellValue::Null],
            // Short row: trailing cells become NULL.
            vec![CellValue::Text("2".into()), CellValue::Text("Bob".into())],
        ];

        let projected = mapping().project_grid(&grid);
        assert_eq!(projected.rows.len(), 2);
        assert_eq!(projected.skipped, 1);
        assert_eq!(projected.rows[1].get("email"), Some(&CellValue::Null));
    }

    #[test]
    fn row_to_cells_follows_letter_order() {
        let mut row = Row::new();
        row.insert("email".into(), CellValue::Text("a@x".into()));
        row.insert("id".into(), CellValue::Int(1));
        row.insert("name".into(), CellValue::Text("Alice".into()));

        let cells = mapping().row_to_cells(&row);
        assert_eq!(cells[0], CellValue::Int(1));
        assert_eq!(cells[1], CellValue::Text("Alice".into()));
        assert_eq!(cells[2], CellValue::Text("a@x".into()));
    }

    #[test]
    fn config_validation() {
        let config = SyncConfig {
            id: "cfg-1".into(),
            name: "users".into(),
            spreadsheet_id: "sheet-1".into(),
            range: default_range(),
            target_db_url: "sqlite://target.db".into(),
            target_table: "users".into(),
            mapping: mapping(),
            conflict_policy: ConflictPolicy::LastWriteWins,
            sync_interval_secs: 30,
            active: true,
        };
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.target_table = " ".into();
        assert!(bad.validate().is_err());

        let mut bad = config;
        bad.sync_interval_secs = 0;
        assert!(matches!(bad.validate(), Err(ConfigError::BadInterval)));
    }
}
