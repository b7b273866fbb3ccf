//! Metadata store: sync configs, per-config cross-cycle state, the run
//! history audit trail, and persisted conflicts.
//!
//! State rows are born with their config and torn down with it. Each worker
//! owns the state fields of its own direction, which is why the trait splits
//! the update into `update_sheet_sync_state` / `update_db_sync_state`
//! instead of exposing a whole-row write.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{ConflictPolicy, SyncConfig};
use crate::conflict::{Conflict, ConflictWinner, Resolution};
use crate::value::Row;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown {kind} '{id}'")]
    NotFound { kind: &'static str, id: String },
    #[error("corrupt {kind} row '{id}'")]
    Corrupt { kind: &'static str, id: String },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlx(
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            )
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    SheetToDb,
    DbToSheet,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::SheetToDb => "sheet_to_db",
            SyncDirection::DbToSheet => "db_to_sheet",
        }
    }

    pub fn parse(s: &str) -> Option<SyncDirection> {
        match s {
            "sheet_to_db" => Some(SyncDirection::SheetToDb),
            "db_to_sheet" => Some(SyncDirection::DbToSheet),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Running,
    Success,
    Failed,
    Partial,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Running => "running",
            HistoryStatus::Success => "success",
            HistoryStatus::Failed => "failed",
            HistoryStatus::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<HistoryStatus> {
        match s {
            "running" => Some(HistoryStatus::Running),
            "success" => Some(HistoryStatus::Success),
            "failed" => Some(HistoryStatus::Failed),
            "partial" => Some(HistoryStatus::Partial),
            _ => None,
        }
    }
}

/// Cross-cycle cursor state, one row per config. This is what makes
/// successive cycles incremental: the ETag short-circuits unchanged sheets
/// and the timestamps bound the change-log scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub config_id: String,
    pub last_sheet_sync_at: Option<DateTime<Utc>>,
    pub last_db_sync_at: Option<DateTime<Utc>>,
    pub sheet_etag: Option<String>,
    pub db_last_change_id: Option<i64>,
}

impl SyncState {
    pub fn empty(config_id: &str) -> Self {
        SyncState {
            config_id: config_id.to_string(),
            last_sheet_sync_at: None,
            last_db_sync_at: None,
            sheet_etag: None,
            db_last_change_id: None,
        }
    }
}

/// One run of one directional worker, append-only.
#[derive(Debug, Clone, Serialize)]
pub struct SyncHistory {
    pub id: String,
    pub config_id: String,
    pub direction: SyncDirection,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rows_affected: i64,
    pub conflicts_detected: i64,
    pub status: HistoryStatus,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
}

impl SyncHistory {
    /// A fresh `running` record for the start of a cycle.
    pub fn begin(config_id: &str, direction: SyncDirection) -> Self {
        SyncHistory {
            id: Uuid::new_v4().to_string(),
            config_id: config_id.to_string(),
            direction,
            started_at: Utc::now(),
            completed_at: None,
            rows_affected: 0,
            conflicts_detected: 0,
            status: HistoryStatus::Running,
            error: None,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Terminal state written into a history row when its run finishes.
#[derive(Debug, Clone)]
pub struct HistoryOutcome {
    pub status: HistoryStatus,
    pub rows_affected: i64,
    pub conflicts_detected: i64,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
}

impl HistoryOutcome {
    pub fn success(rows_affected: i64, conflicts_detected: i64, metadata: serde_json::Value) -> Self {
        HistoryOutcome {
            status: HistoryStatus::Success,
            rows_affected,
            conflicts_detected,
            error: None,
            metadata,
        }
    }

    pub fn failed(error: String) -> Self {
        HistoryOutcome {
            status: HistoryStatus::Failed,
            rows_affected: 0,
            conflicts_detected: 0,
            error: Some(error),
            metadata: serde_json::Value::Null,
        }
    }
}

/// A persisted conflict, append-only. `resolved_at` stays null for manual
/// conflicts until somebody arbitrates them out-of-band.
#[derive(Debug, Clone)]
pub struct ConflictRecord {
    pub id: String,
    pub config_id: String,
    pub row_key: String,
    pub sheet_value: Row,
    pub table_value: Row,
    pub sheet_changed_at: DateTime<Utc>,
    pub table_changed_at: DateTime<Utc>,
    pub strategy: ConflictPolicy,
    pub winner: Option<ConflictWinner>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_value: Option<Row>,
}

impl ConflictRecord {
    pub fn from_resolution(
        config_id: &str,
        conflict: &Conflict,
        strategy: ConflictPolicy,
        resolution: &Resolution,
    ) -> Self {
        let resolved = resolution.winner != ConflictWinner::Manual;
        ConflictRecord {
            id: Uuid::new_v4().to_string(),
            config_id: config_id.to_string(),
            row_key: conflict.row_key.clone(),
            sheet_value: conflict.sheet_row.clone(),
            table_value: conflict.table_row.clone(),
            sheet_changed_at: conflict.sheet_changed_at,
            table_changed_at: conflict.table_changed_at,
            strategy,
            winner: Some(resolution.winner),
            resolved_at: resolved.then(Utc::now),
            resolved_value: resolution.resolved_value.clone(),
        }
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn upsert_config(&self, config: &SyncConfig) -> Result<(), StoreError>;
    async fn get_config(&self, id: &str) -> Result<Option<SyncConfig>, StoreError>;
    async fn list_active_configs(&self) -> Result<Vec<SyncConfig>, StoreError>;
    /// Removes the config and its state, history and conflicts.
    async fn delete_config(&self, id: &str) -> Result<(), StoreError>;

    /// Never fails on a missing row: a config that has not synced yet reads
    /// as the empty state.
    async fn get_state(&self, config_id: &str) -> Result<SyncState, StoreError>;
    async fn update_sheet_sync_state(
        &self,
        config_id: &str,
        last_sheet_sync_at: DateTime<Utc>,
        sheet_etag: Option<String>,
    ) -> Result<(), StoreError>;
    async fn update_db_sync_state(
        &self,
        config_id: &str,
        last_db_sync_at: DateTime<Utc>,
        db_last_change_id: Option<i64>,
    ) -> Result<(), StoreError>;

    async fn create_history(&self, history: &SyncHistory) -> Result<(), StoreError>;
    async fn finalize_history(
        &self,
        history_id: &str,
        outcome: HistoryOutcome,
    ) -> Result<(), StoreError>;
    async fn list_history(
        &self,
        config_id: &str,
        limit: i64,
    ) -> Result<Vec<SyncHistory>, StoreError>;

    async fn insert_conflict(&self, record: &ConflictRecord) -> Result<(), StoreError>;
    async fn list_conflicts(
        &self,
        config_id: &str,
        unresolved_only: bool,
    ) -> Result<Vec<ConflictRecord>, StoreError>;
}
