//! Target-table adapter: pooled access to the synced table, tagged writes,
//! and the change-capture log.
//!
//! Every mutation can carry a write-tag. The tag is written into the
//! `_sync_source_tag` table inside the same transaction as the DML, the
//! row triggers copy it into each change-log row, and the adapter removes it
//! again on every exit path so a reused pooled connection can never leak a
//! stale tag.

pub mod triggers;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, SqlitePool};
use thiserror::Error;

use crate::config::ColumnMapping;
use crate::detect::ChangeSet;
use crate::value::{row_from_json, CellValue, Row};

/// Write-tag stamped by the Spreadsheet→Table worker. The Table→Spreadsheet
/// worker excludes rows carrying it, which is what breaks the feedback loop.
pub const FROM_SHEET_TAG: &str = "from_sheet";

/// Default tag the triggers record when no session tag is set.
pub const EXTERNAL_TAG: &str = "external";

pub const CHANGE_LOG_TABLE: &str = "sync_change_log";
pub const SOURCE_TAG_TABLE: &str = "_sync_source_tag";

pub const DEFAULT_CHANGE_LOG_LIMIT: i64 = 1000;

#[derive(Error, Debug)]
pub enum TargetDbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed change-log row {0}")]
    BadChangeLogRow(i64),
}

impl TargetDbError {
    /// Pool exhaustion and broken connections are infrastructure problems
    /// the retry wrapper should absorb; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TargetDbError::Sqlx(
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            )
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "INSERT",
            ChangeOp::Update => "UPDATE",
            ChangeOp::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<ChangeOp> {
        match s {
            "INSERT" => Some(ChangeOp::Insert),
            "UPDATE" => Some(ChangeOp::Update),
            "DELETE" => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

/// One captured row-level change on the target table.
#[derive(Debug, Clone)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub table_name: String,
    pub op: ChangeOp,
    /// JSON snapshot of the row: all mapped columns for INSERT/UPDATE, the
    /// primary key only for DELETE.
    pub row: Row,
    pub source_tag: String,
    pub changed_at: DateTime<Utc>,
    pub processed: bool,
}

#[derive(Clone)]
pub struct TargetDb {
    pool: SqlitePool,
}

impl TargetDb {
    pub async fn connect(url: &str) -> Result<Self, TargetDbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        Ok(TargetDb { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        TargetDb { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Install the change-log table and the three row triggers for `table`.
    /// Idempotent; re-running after a mapping change refreshes the captured
    /// column set.
    pub async fn install_cdc(
        &self,
        table: &str,
        mapping: &ColumnMapping,
    ) -> Result<(), TargetDbError> {
        for statement in triggers::cdc_statements(table, mapping) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Read the full projection of mapped columns, ordered by primary key.
    pub async fn fetch_rows(
        &self,
        table: &str,
        mapping: &ColumnMapping,
    ) -> Result<Vec<Row>, TargetDbError> {
        let sql = format!(
            "SELECT {} AS row_snapshot FROM {} ORDER BY {}",
            json_object_columns(mapping),
            quote_ident(table),
            quote_ident(mapping.primary_key_column()),
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let snapshot: String = row.try_get("row_snapshot")?;
            let value: serde_json::Value = serde_json::from_str(&snapshot)?;
            if let Some(parsed) = row_from_json(value) {
                result.push(parsed);
            }
        }
        Ok(result)
    }

    /// Apply a change set in one transaction: upserts for inserts, keyed
    /// updates, keyed deletes. All change-log rows produced by the
    /// transaction carry `tag`.
    pub async fn apply_changes(
        &self,
        table: &str,
        mapping: &ColumnMapping,
        changes: &ChangeSet,
        tag: Option<&str>,
    ) -> Result<u64, TargetDbError> {
        let mut tx = self.pool.begin().await?;

        if let Some(tag) = tag {
            sqlx::query(&format!("DELETE FROM {SOURCE_TAG_TABLE}"))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!("INSERT INTO {SOURCE_TAG_TABLE} (tag) VALUES (?)"))
                .bind(tag.to_string())
                .execute(&mut *tx)
                .await?;
        }

        let applied = apply_in_tx(&mut tx, table, mapping, changes).await;

        // Clear the tag on success and failure alike. A rollback reverts the
        // tag row as well, so either path leaves the table empty.
        let cleared = match tag {
            Some(_) => sqlx::query(&format!("DELETE FROM {SOURCE_TAG_TABLE}"))
                .execute(&mut *tx)
                .await
                .map(|_| ()),
            None => Ok(()),
        };

        match (applied, cleared) {
            (Ok(affected), Ok(())) => {
                tx.commit().await?;
                Ok(affected)
            }
            (Err(e), _) => {
                let _ = tx.rollback().await;
                Err(e)
            }
            (Ok(_), Err(e)) => {
                let _ = tx.rollback().await;
                Err(e.into())
            }
        }
    }

    /// Unprocessed change-log rows for `table`, excluding `exclude_tag`
    /// writes, in id order, bounded by `limit`.
    pub async fn fetch_change_log(
        &self,
        table: &str,
        exclude_tag: &str,
        limit: i64,
    ) -> Result<Vec<ChangeLogEntry>, TargetDbError> {
        let rows = sqlx::query(
            "SELECT id, table_name, op, row_snapshot, source_tag, changed_at, processed
             FROM sync_change_log
             WHERE table_name = ?1
               AND processed = 0
               AND (source_tag IS NULL OR source_tag != ?2)
             ORDER BY id ASC
             LIMIT ?3",
        )
        .bind(table)
        .bind(exclude_tag)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }

    /// Change-log rows (processed or not) newer than `since`, excluding
    /// `exclude_tag` writes. Feeds table-side conflict detection.
    pub async fn fetch_change_log_since(
        &self,
        table: &str,
        exclude_tag: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChangeLogEntry>, TargetDbError> {
        let rows = match since {
            Some(ts) => {
                sqlx::query(
                    "SELECT id, table_name, op, row_snapshot, source_tag, changed_at, processed
                     FROM sync_change_log
                     WHERE table_name = ?1
                       AND (source_tag IS NULL OR source_tag != ?2)
                       AND changed_at > ?3
                     ORDER BY id ASC",
                )
                .bind(table)
                .bind(exclude_tag)
                .bind(format_changed_at(ts))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, table_name, op, row_snapshot, source_tag, changed_at, processed
                     FROM sync_change_log
                     WHERE table_name = ?1
                       AND (source_tag IS NULL OR source_tag != ?2)
                     ORDER BY id ASC",
                )
                .bind(table)
                .bind(exclude_tag)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(entry_from_row).collect()
    }

    /// Flip `processed` for the given ids in one statement. Returns how many
    /// rows actually flipped (already-processed ids are left alone).
    pub async fn mark_changes_processed(&self, ids: &[i64]) -> Result<u64, TargetDbError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE {CHANGE_LOG_TABLE} SET processed = 1
             WHERE id IN ({placeholders}) AND processed = 0"
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }
}

async fn apply_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    table: &str,
    mapping: &ColumnMapping,
    changes: &ChangeSet,
) -> Result<u64, TargetDbError> {
    let pk = mapping.primary_key_column();
    let quoted_table = quote_ident(table);
    let mut affected = 0u64;

    if !changes.inserts.is_empty() {
        let columns: Vec<String> = mapping.column_names().map(quote_ident).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let conflict_action = if columns.len() == 1 {
            "DO NOTHING".to_string()
        } else {
            let assignments: Vec<String> = mapping
                .column_names()
                .skip(1)
                .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
                .collect();
            format!("DO UPDATE SET {}", assignments.join(", "))
        };
        let sql = format!(
            "INSERT INTO {quoted_table} ({}) VALUES ({placeholders})
             ON CONFLICT({}) {conflict_action}",
            columns.join(", "),
            quote_ident(pk),
        );

        for row in &changes.inserts {
            let mut query = sqlx::query(&sql);
            for cell in mapping.row_to_cells(row) {
                query = bind_cell(query, &cell);
            }
            affected += query.execute(&mut **tx).await?.rows_affected();
        }
    }

    if !changes.updates.is_empty() {
        let assignments: Vec<String> = mapping
            .column_names()
            .skip(1)
            .map(|c| format!("{} = ?", quote_ident(c)))
            .collect();
        let sql = format!(
            "UPDATE {quoted_table} SET {} WHERE {} = ?",
            assignments.join(", "),
            quote_ident(pk),
        );

        for update in &changes.updates {
            let mut query = sqlx::query(&sql);
            for column in mapping.column_names().skip(1) {
                let cell = update.row.get(column).cloned().unwrap_or(CellValue::Null);
                query = bind_cell(query, &cell);
            }
            query = query.bind(update.key.clone());
            affected += query.execute(&mut **tx).await?.rows_affected();
        }
    }

    if !changes.deletes.is_empty() {
        let sql = format!("DELETE FROM {quoted_table} WHERE {} = ?", quote_ident(pk));
        for key in &changes.deletes {
            affected += sqlx::query(&sql)
                .bind(key.clone())
                .execute(&mut **tx)
                .await?
                .rows_affected();
        }
    }

    Ok(affected)
}

fn entry_from_row(row: SqliteRow) -> Result<ChangeLogEntry, TargetDbError> {
    let id: i64 = row.try_get("id")?;
    let op_text: String = row.try_get("op")?;
    let op = ChangeOp::parse(&op_text).ok_or(TargetDbError::BadChangeLogRow(id))?;
    let snapshot: String = row.try_get("row_snapshot")?;
    let value: serde_json::Value = serde_json::from_str(&snapshot)?;
    let parsed = row_from_json(value).ok_or(TargetDbError::BadChangeLogRow(id))?;
    let source_tag: Option<String> = row.try_get("source_tag")?;
    let changed_at_text: String = row.try_get("changed_at")?;
    let changed_at = DateTime::parse_from_rfc3339(&changed_at_text)
        .map_err(|_| TargetDbError::BadChangeLogRow(id))?
        .with_timezone(&Utc);
    let processed: i64 = row.try_get("processed")?;

    Ok(ChangeLogEntry {
        id,
        table_name: row.try_get("table_name")?,
        op,
        row: parsed,
        source_tag: source_tag.unwrap_or_else(|| EXTERNAL_TAG.to_string()),
        changed_at,
        processed: processed != 0,
    })
}

fn bind_cell<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    cell: &CellValue,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match cell {
        CellValue::Null => query.bind(None::<String>),
        CellValue::Bool(b) => query.bind(*b),
        CellValue::Int(i) => query.bind(*i),
        CellValue::Float(f) => query.bind(*f),
        CellValue::Text(s) => query.bind(s.clone()),
        CellValue::Timestamp(ts) => query.bind(ts.to_rfc3339()),
        CellValue::Json(v) => query.bind(v.to_string()),
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn json_object_columns(mapping: &ColumnMapping) -> String {
    let pairs: Vec<String> = mapping
        .column_names()
        .map(|c| format!("'{}', {}", c.replace('\'', "''"), quote_ident(c)))
        .collect();
    format!("json_object({})", pairs.join(", "))
}

/// The trigger clock format: UTC with millisecond precision and a literal Z,
/// so lexicographic comparison matches chronological order.
fn format_changed_at(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::RowUpdate;
    use tempfile::TempDir;

    fn mapping() -> ColumnMapping {
        ColumnMapping::new(vec![
            ('A', "id".into()),
            ('B', "name".into()),
            ('C', "email".into()),
        ])
        .expect("mapping")
    }

    fn user(id: i64, name: &str, email: &str) -> Row {
        [
            ("id".to_string(), CellValue::Int(id)),
            ("name".to_string(), CellValue::Text(name.into())),
            ("email".to_string(), CellValue::Text(email.into())),
        ]
        .into_iter()
        .collect()
    }

    fn inserts(rows: Vec<Row>) -> ChangeSet {
        ChangeSet {
            inserts: rows,
            updates: vec![],
            deletes: vec![],
        }
    }

    async fn setup() -> (TempDir, TargetDb) {
        let dir = TempDir::new().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("target.db").display());
        let db = TargetDb::connect(&url).await.expect("connect");
        sqlx::query("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT)")
            .execute(db.pool())
            .await
            .expect("create table");
        db.install_cdc("users", &mapping()).await.expect("install cdc");
        (dir, db)
    }

    #[tokio::test]
    async fn upsert_inserts_then_overwrites() {
        let (_dir, db) = setup().await;

        let n = db
            .apply_changes("users", &mapping(), &inserts(vec![user(1, "Alice", "a@x")]), None)
            .await
            .expect("insert");
        assert_eq!(n, 1);

        // Same key again: row-level last-write-wins.
        db.apply_changes(
            "users",
            &mapping(),
            &inserts(vec![user(1, "Alicia", "a@x")]),
            None,
        )
        .await
        .expect("upsert");

        let rows = db.fetch_rows("users", &mapping()).await.expect("fetch");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&CellValue::Text("Alicia".into())));
    }

    #[tokio::test]
    async fn tagged_writes_stamp_the_change_log() {
        let (_dir, db) = setup().await;

        db.apply_changes(
            "users",
            &mapping(),
            &inserts(vec![user(1, "Alice", "a@x")]),
            Some(FROM_SHEET_TAG),
        )
        .await
        .expect("tagged insert");

        // External writer, no tag set.
        sqlx::query("INSERT INTO users (id, name, email) VALUES (2, 'Bob', 'b@x')")
            .execute(db.pool())
            .await
            .expect("external insert");

        let all = db
            .fetch_change_log_since("users", "nobody", None)
            .await
            .expect("scan");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].source_tag, FROM_SHEET_TAG);
        assert_eq!(all[1].source_tag, EXTERNAL_TAG);

        // The loop filter drops the sheet-sourced row.
        let external_only = db
            .fetch_change_log("users", FROM_SHEET_TAG, DEFAULT_CHANGE_LOG_LIMIT)
            .await
            .expect("filtered scan");
        assert_eq!(external_only.len(), 1);
        assert_eq!(external_only[0].source_tag, EXTERNAL_TAG);
        assert_eq!(external_only[0].op, ChangeOp::Insert);
    }

    #[tokio::test]
    async fn tag_does_not_leak_after_failure() {
        let (_dir, db) = setup().await;

        let bad_mapping =
            ColumnMapping::new(vec![('A', "id".into()), ('B', "missing".into())]).unwrap();
        let err = db
            .apply_changes(
                "users",
                &bad_mapping,
                &inserts(vec![user(1, "Alice", "a@x")]),
                Some(FROM_SHEET_TAG),
            )
            .await;
        assert!(err.is_err());

        // The failed transaction rolled back its tag row.
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sync_source_tag")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(count, 0);

        sqlx::query("INSERT INTO users (id, name, email) VALUES (3, 'Carol', 'c@x')")
            .execute(db.pool())
            .await
            .expect("external insert");
        let entries = db
            .fetch_change_log("users", FROM_SHEET_TAG, DEFAULT_CHANGE_LOG_LIMIT)
            .await
            .expect("scan");
        assert_eq!(entries.last().unwrap().source_tag, EXTERNAL_TAG);
    }

    #[tokio::test]
    async fn update_and_delete_triggers_capture() {
        let (_dir, db) = setup().await;

        sqlx::query("INSERT INTO users (id, name, email) VALUES (1, 'Alice', 'a@x')")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE users SET name = 'Alicia' WHERE id = 1")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("DELETE FROM users WHERE id = 1")
            .execute(db.pool())
            .await
            .unwrap();

        let entries = db
            .fetch_change_log("users", FROM_SHEET_TAG, DEFAULT_CHANGE_LOG_LIMIT)
            .await
            .expect("scan");
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[1].op, ChangeOp::Update);
        assert_eq!(
            entries[1].row.get("name"),
            Some(&CellValue::Text("Alicia".into()))
        );

        // DELETE snapshots only the primary key.
        assert_eq!(entries[2].op, ChangeOp::Delete);
        assert_eq!(entries[2].row.len(), 1);
        assert_eq!(entries[2].row.get("id"), Some(&CellValue::Int(1)));

        // Ids are strictly increasing.
        assert!(entries.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn mark_processed_flips_exactly_once() {
        let (_dir, db) = setup().await;

        sqlx::query("INSERT INTO users (id, name, email) VALUES (1, 'Alice', 'a@x')")
            .execute(db.pool())
            .await
            .unwrap();
        let entries = db
            .fetch_change_log("users", FROM_SHEET_TAG, DEFAULT_CHANGE_LOG_LIMIT)
            .await
            .unwrap();
        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();

        assert_eq!(db.mark_changes_processed(&ids).await.unwrap(), 1);
        assert_eq!(db.mark_changes_processed(&ids).await.unwrap(), 0);

        let remaining = db
            .fetch_change_log("users", FROM_SHEET_TAG, DEFAULT_CHANGE_LOG_LIMIT)
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn scan_respects_the_batch_bound() {
        let (_dir, db) = setup().await;

        for i in 0..1005i64 {
            sqlx::query("INSERT INTO users (id, name, email) VALUES (?, 'n', 'e')")
                .bind(i)
                .execute(db.pool())
                .await
                .unwrap();
        }

        let entries = db
            .fetch_change_log("users", FROM_SHEET_TAG, DEFAULT_CHANGE_LOG_LIMIT)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1000);
        assert!(entries.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn keyed_update_and_delete() {
        let (_dir, db) = setup().await;

        db.apply_changes(
            "users",
            &mapping(),
            &inserts(vec![user(1, "Alice", "a@x"), user(2, "Bob", "b@x")]),
            None,
        )
        .await
        .unwrap();

        let changes = ChangeSet {
            inserts: vec![],
            updates: vec![RowUpdate {
                key: "1".into(),
                row: user(1, "Alicia", "a@x"),
                changed_columns: vec!["name".into()],
            }],
            deletes: vec!["2".into()],
        };
        let affected = db
            .apply_changes("users", &mapping(), &changes, Some(FROM_SHEET_TAG))
            .await
            .unwrap();
        assert_eq!(affected, 2);

        let rows = db.fetch_rows("users", &mapping()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&CellValue::Text("Alicia".into())));
    }
}
