//! sqlx-backed metadata store. The schema is created on open, so a fresh
//! deployment needs nothing beyond a writable database URL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, SqlitePool};

use super::{
    ConflictRecord, HistoryOutcome, HistoryStatus, MetadataStore, StoreError, SyncDirection,
    SyncHistory, SyncState,
};
use crate::config::{ConflictPolicy, SyncConfig};
use crate::conflict::ConflictWinner;
use crate::value::{row_from_json, row_to_json, Row};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sync_configs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        active INTEGER NOT NULL,
        config TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sync_state (
        config_id TEXT PRIMARY KEY,
        last_sheet_sync_at TEXT,
        last_db_sync_at TEXT,
        sheet_etag TEXT,
        db_last_change_id INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS sync_history (
        id TEXT PRIMARY KEY,
        config_id TEXT NOT NULL,
        direction TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        rows_affected INTEGER NOT NULL DEFAULT 0,
        conflicts_detected INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        error TEXT,
        metadata TEXT NOT NULL DEFAULT 'null'
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_history_config
     ON sync_history (config_id, started_at DESC)",
    "CREATE TABLE IF NOT EXISTS sync_conflicts (
        id TEXT PRIMARY KEY,
        config_id TEXT NOT NULL,
        row_key TEXT NOT NULL,
        sheet_value TEXT NOT NULL,
        table_value TEXT NOT NULL,
        sheet_changed_at TEXT NOT NULL,
        table_changed_at TEXT NOT NULL,
        strategy TEXT NOT NULL,
        winner TEXT,
        resolved_at TEXT,
        resolved_value TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_config
     ON sync_conflicts (config_id)",
];

pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(SqliteMetadataStore { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(kind: &'static str, id: &str, s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt {
            kind,
            id: id.to_string(),
        })
}

fn opt_ts(
    kind: &'static str,
    id: &str,
    s: Option<String>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|s| parse_ts(kind, id, &s)).transpose()
}

fn row_column(kind: &'static str, id: &str, json: &str) -> Result<Row, StoreError> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    row_from_json(value).ok_or(StoreError::Corrupt {
        kind,
        id: id.to_string(),
    })
}

fn history_from_row(row: SqliteRow) -> Result<SyncHistory, StoreError> {
    let id: String = row.try_get("id")?;
    let direction_text: String = row.try_get("direction")?;
    let status_text: String = row.try_get("status")?;
    let started_at: String = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    let metadata_text: String = row.try_get("metadata")?;

    Ok(SyncHistory {
        config_id: row.try_get("config_id")?,
        direction: SyncDirection::parse(&direction_text).ok_or(StoreError::Corrupt {
            kind: "history",
            id: id.clone(),
        })?,
        started_at: parse_ts("history", &id, &started_at)?,
        completed_at: opt_ts("history", &id, completed_at)?,
        rows_affected: row.try_get("rows_affected")?,
        conflicts_detected: row.try_get("conflicts_detected")?,
        status: HistoryStatus::parse(&status_text).ok_or(StoreError::Corrupt {
            kind: "history",
            id: id.clone(),
        })?,
        error: row.try_get("error")?,
        metadata: serde_json::from_str(&metadata_text)?,
        id,
    })
}

fn conflict_from_row(row: SqliteRow) -> Result<ConflictRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let strategy_text: String = row.try_get("strategy")?;
    let winner_text: Option<String> = row.try_get("winner")?;
    let sheet_value: String = row.try_get("sheet_value")?;
    let table_value: String = row.try_get("table_value")?;
    let sheet_changed_at: String = row.try_get("sheet_changed_at")?;
    let table_changed_at: String = row.try_get("table_changed_at")?;
    let resolved_at: Option<String> = row.try_get("resolved_at")?;
    let resolved_value: Option<String> = row.try_get("resolved_value")?;

    Ok(ConflictRecord {
        config_id: row.try_get("config_id")?,
        row_key: row.try_get("row_key")?,
        sheet_value: row_column("conflict", &id, &sheet_value)?,
        table_value: row_column("conflict", &id, &table_value)?,
        sheet_changed_at: parse_ts("conflict", &id, &sheet_changed_at)?,
        table_changed_at: parse_ts("conflict", &id, &table_changed_at)?,
        strategy: ConflictPolicy::parse(&strategy_text).ok_or(StoreError::Corrupt {
            kind: "conflict",
            id: id.clone(),
        })?,
        winner: winner_text.and_then(|w| ConflictWinner::parse(&w)),
        resolved_at: opt_ts("conflict", &id, resolved_at)?,
        resolved_value: resolved_value
            .map(|v| row_column("conflict", &id, &v))
            .transpose()?,
        id,
    })
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn upsert_config(&self, config: &SyncConfig) -> Result<(), StoreError> {
        let json = serde_json::to_string(config)?;
        sqlx::query(
            "INSERT INTO sync_configs (id, name, active, config) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = ?2, active = ?3, config = ?4",
        )
        .bind(&config.id)
        .bind(&config.name)
        .bind(config.active)
        .bind(json)
        .execute(&self.pool)
        .await?;

        // State is born with the config.
        sqlx::query("INSERT OR IGNORE INTO sync_state (config_id) VALUES (?)")
            .bind(&config.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_config(&self, id: &str) -> Result<Option<SyncConfig>, StoreError> {
        let row = sqlx::query("SELECT config FROM sync_configs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let json: String = row.try_get("config")?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn list_active_configs(&self) -> Result<Vec<SyncConfig>, StoreError> {
        let rows = sqlx::query("SELECT config FROM sync_configs WHERE active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut configs = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.try_get("config")?;
            configs.push(serde_json::from_str(&json)?);
        }
        Ok(configs)
    }

    async fn delete_config(&self, id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sync_conflicts WHERE config_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sync_history WHERE config_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sync_state WHERE config_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sync_configs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_state(&self, config_id: &str) -> Result<SyncState, StoreError> {
        let row = sqlx::query(
            "SELECT last_sheet_sync_at, last_db_sync_at, sheet_etag, db_last_change_id
             FROM sync_state WHERE config_id = ?",
        )
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(SyncState::empty(config_id));
        };
        let last_sheet: Option<String> = row.try_get("last_sheet_sync_at")?;
        let last_db: Option<String> = row.try_get("last_db_sync_at")?;

        Ok(SyncState {
            config_id: config_id.to_string(),
            last_sheet_sync_at: opt_ts("state", config_id, last_sheet)?,
            last_db_sync_at: opt_ts("state", config_id, last_db)?,
            sheet_etag: row.try_get("sheet_etag")?,
            db_last_change_id: row.try_get("db_last_change_id")?,
        })
    }

    async fn update_sheet_sync_state(
        &self,
        config_id: &str,
        last_sheet_sync_at: DateTime<Utc>,
        sheet_etag: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_state (config_id, last_sheet_sync_at, sheet_etag)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(config_id) DO UPDATE SET last_sheet_sync_at = ?2, sheet_etag = ?3",
        )
        .bind(config_id)
        .bind(ts(&last_sheet_sync_at))
        .bind(sheet_etag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_db_sync_state(
        &self,
        config_id: &str,
        last_db_sync_at: DateTime<Utc>,
        db_last_change_id: Option<i64>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_state (config_id, last_db_sync_at, db_last_change_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(config_id) DO UPDATE SET last_db_sync_at = ?2, db_last_change_id = ?3",
        )
        .bind(config_id)
        .bind(ts(&last_db_sync_at))
        .bind(db_last_change_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_history(&self, history: &SyncHistory) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_history
             (id, config_id, direction, started_at, completed_at, rows_affected,
              conflicts_detected, status, error, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&history.id)
        .bind(&history.config_id)
        .bind(history.direction.as_str())
        .bind(ts(&history.started_at))
        .bind(history.completed_at.as_ref().map(ts))
        .bind(history.rows_affected)
        .bind(history.conflicts_detected)
        .bind(history.status.as_str())
        .bind(&history.error)
        .bind(serde_json::to_string(&history.metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_history(
        &self,
        history_id: &str,
        outcome: HistoryOutcome,
    ) -> Result<(), StoreError> {
        let affected = sqlx::query(
            "UPDATE sync_history
             SET completed_at = ?2, rows_affected = ?3, conflicts_detected = ?4,
                 status = ?5, error = ?6, metadata = ?7
             WHERE id = ?1",
        )
        .bind(history_id)
        .bind(ts(&Utc::now()))
        .bind(outcome.rows_affected)
        .bind(outcome.conflicts_detected)
        .bind(outcome.status.as_str())
        .bind(&outcome.error)
        .bind(serde_json::to_string(&outcome.metadata)?)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::NotFound {
                kind: "history",
                id: history_id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_history(
        &self,
        config_id: &str,
        limit: i64,
    ) -> Result<Vec<SyncHistory>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM sync_history
             WHERE config_id = ? ORDER BY started_at DESC, id LIMIT ?",
        )
        .bind(config_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(history_from_row).collect()
    }

    async fn insert_conflict(&self, record: &ConflictRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_conflicts
             (id, config_id, row_key, sheet_value, table_value, sheet_changed_at,
              table_changed_at, strategy, winner, resolved_at, resolved_value)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.config_id)
        .bind(&record.row_key)
        .bind(row_to_json(&record.sheet_value).to_string())
        .bind(row_to_json(&record.table_value).to_string())
        .bind(ts(&record.sheet_changed_at))
        .bind(ts(&record.table_changed_at))
        .bind(record.strategy.as_str())
        .bind(record.winner.map(|w| w.as_str()))
        .bind(record.resolved_at.as_ref().map(ts))
        .bind(record.resolved_value.as_ref().map(|r| row_to_json(r).to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_conflicts(
        &self,
        config_id: &str,
        unresolved_only: bool,
    ) -> Result<Vec<ConflictRecord>, StoreError> {
        let sql = if unresolved_only {
            "SELECT * FROM sync_conflicts
             WHERE config_id = ? AND resolved_at IS NULL ORDER BY table_changed_at"
        } else {
            "SELECT * FROM sync_conflicts WHERE config_id = ? ORDER BY table_changed_at"
        };
        let rows = sqlx::query(sql).bind(config_id).fetch_all(&self.pool).await?;
        rows.into_iter().map(conflict_from_row).collect()
    }
}
