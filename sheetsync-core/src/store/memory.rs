//! In-memory metadata store for tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ConflictRecord, HistoryOutcome, MetadataStore, StoreError, SyncConfig, SyncHistory, SyncState,
};

#[derive(Default)]
struct Inner {
    configs: HashMap<String, SyncConfig>,
    states: HashMap<String, SyncState>,
    history: Vec<SyncHistory>,
    conflicts: Vec<ConflictRecord>,
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: Mutex<Inner>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        MemoryMetadataStore::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn upsert_config(&self, config: &SyncConfig) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner
            .states
            .entry(config.id.clone())
            .or_insert_with(|| SyncState::empty(&config.id));
        inner.configs.insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn get_config(&self, id: &str) -> Result<Option<SyncConfig>, StoreError> {
        Ok(self.inner.lock().expect("store lock").configs.get(id).cloned())
    }

    async fn list_active_configs(&self) -> Result<Vec<SyncConfig>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        let mut configs: Vec<SyncConfig> =
            inner.configs.values().filter(|c| c.active).cloned().collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(configs)
    }

    async fn delete_config(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.configs.remove(id);
        inner.states.remove(id);
        inner.history.retain(|h| h.config_id != id);
        inner.conflicts.retain(|c| c.config_id != id);
        Ok(())
    }

    async fn get_state(&self, config_id: &str) -> Result<SyncState, StoreError> {
        Ok(self
            .inner
            .lock()
            .expect("store lock")
            .states
            .get(config_id)
            .cloned()
            .unwrap_or_else(|| SyncState::empty(config_id)))
    }

    async fn update_sheet_sync_state(
        &self,
        config_id: &str,
        last_sheet_sync_at: DateTime<Utc>,
        sheet_etag: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let state = inner
            .states
            .entry(config_id.to_string())
            .or_insert_with(|| SyncState::empty(config_id));
        state.last_sheet_sync_at = Some(last_sheet_sync_at);
        state.sheet_etag = sheet_etag;
        Ok(())
    }

    async fn update_db_sync_state(
        &self,
        config_id: &str,
        last_db_sync_at: DateTime<Utc>,
        db_last_change_id: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let state = inner
            .states
            .entry(config_id.to_string())
            .or_insert_with(|| SyncState::empty(config_id));
        state.last_db_sync_at = Some(last_db_sync_at);
        state.db_last_change_id = db_last_change_id;
        Ok(())
    }

    async fn create_history(&self, history: &SyncHistory) -> Result<(), StoreError> {
        self.inner
            .lock()
            .expect("store lock")
            .history
            .push(history.clone());
        Ok(())
    }

    async fn finalize_history(
        &self,
        history_id: &str,
        outcome: HistoryOutcome,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let Some(row) = inner.history.iter_mut().find(|h| h.id == history_id) else {
            return Err(StoreError::NotFound {
                kind: "history",
                id: history_id.to_string(),
            });
        };
        row.completed_at = Some(Utc::now());
        row.rows_affected = outcome.rows_affected;
        row.conflicts_detected = outcome.conflicts_detected;
        row.status = outcome.status;
        row.error = outcome.error;
        row.metadata = outcome.metadata;
        Ok(())
    }

    async fn list_history(
        &self,
        config_id: &str,
        limit: i64,
    ) -> Result<Vec<SyncHistory>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        let mut rows: Vec<SyncHistory> = inner
            .history
            .iter()
            .filter(|h| h.config_id == config_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn insert_conflict(&self, record: &ConflictRecord) -> Result<(), StoreError> {
        self.inner
            .lock()
            .expect("store lock")
            .conflicts
            .push(record.clone());
        Ok(())
    }

    async fn list_conflicts(
        &self,
        config_id: &str,
        unresolved_only: bool,
    ) -> Result<Vec<ConflictRecord>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .conflicts
            .iter()
            .filter(|c| c.config_id == config_id)
            .filter(|c| !unresolved_only || c.resolved_at.is_none())
            .cloned()
            .collect())
    }
}
