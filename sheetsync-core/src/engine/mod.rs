//! The sync engine: directional workers plus the orchestrator that drives
//! them, sharing one process-scoped context.

pub mod db_to_sheet;
pub mod orchestrator;
pub mod sheet_to_db;
#[cfg(test)]
mod test_helpers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::{ConfigError, EngineSettings, SyncConfig};
use crate::dlq::{DeadLetterQueue, FailureReason};
use crate::events::EventSink;
use crate::idempotency::{IdempotencyError, IdempotencyStore};
use crate::metrics::MetricsSink;
use crate::retry::RetryPolicy;
use crate::sheet::{SheetClient, SheetError};
use crate::store::{MetadataStore, StoreError};
use crate::target::{TargetDb, TargetDbError};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("spreadsheet error: {0}")]
    Sheet(#[from] SheetError),
    #[error("target database error: {0}")]
    Target(#[from] TargetDbError),
    #[error("metadata store error: {0}")]
    Store(#[from] StoreError),
    #[error("idempotency store error: {0}")]
    Idempotency(#[from] IdempotencyError),
    #[error("invalid sync config: {0}")]
    Config(#[from] ConfigError),
    #[error("unknown sync config '{0}'")]
    UnknownConfig(String),
}

impl SyncError {
    /// Whether the retry wrapper should take another attempt at the cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Sheet(e) => e.is_retryable(),
            SyncError::Target(e) => e.is_retryable(),
            SyncError::Store(e) => e.is_retryable(),
            SyncError::Idempotency(_) => true,
            SyncError::Config(_) | SyncError::UnknownConfig(_) => false,
        }
    }

    pub fn failure_reason(&self) -> FailureReason {
        if self.is_retryable() {
            FailureReason::MaxRetries
        } else {
            FailureReason::NonRetryable
        }
    }
}

/// What a directional run reports back to the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub rows_affected: u64,
    pub conflicts: u64,
    /// Rows skipped over data problems (missing primary key and the like).
    pub skipped: u64,
    pub note: Option<String>,
}

impl CycleOutcome {
    pub fn no_changes(note: &str) -> Self {
        CycleOutcome {
            note: Some(note.to_string()),
            ..CycleOutcome::default()
        }
    }
}

/// Process-scoped components, constructed once at startup and passed to
/// everything that runs a cycle. There is no module-level state anywhere in
/// the engine.
pub struct EngineContext {
    pub store: Arc<dyn MetadataStore>,
    pub sheets: Arc<dyn SheetClient>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub events: Arc<dyn EventSink>,
    pub metrics: Arc<dyn MetricsSink>,
    pub dlq: Arc<DeadLetterQueue>,
    pub settings: EngineSettings,
    /// One connection pool per target database URL.
    targets: Mutex<HashMap<String, TargetDb>>,
}

impl EngineContext {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        sheets: Arc<dyn SheetClient>,
        idempotency: Arc<dyn IdempotencyStore>,
        events: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
        dlq: Arc<DeadLetterQueue>,
        settings: EngineSettings,
    ) -> Self {
        EngineContext {
            store,
            sheets,
            idempotency,
            events,
            metrics,
            dlq,
            settings,
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// The pooled target-database handle for a config, connecting on first
    /// use.
    pub async fn target_for(&self, config: &SyncConfig) -> Result<TargetDb, SyncError> {
        let mut targets = self.targets.lock().await;
        if let Some(db) = targets.get(&config.target_db_url) {
            return Ok(db.clone());
        }
        let db = TargetDb::connect(&config.target_db_url).await?;
        targets.insert(config.target_db_url.clone(), db.clone());
        Ok(db)
    }

    /// Pre-register an already-connected target (startup wiring, tests).
    pub async fn register_target(&self, url: &str, db: TargetDb) {
        self.targets.lock().await.insert(url.to_string(), db);
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.settings.max_retry_attempts,
            base_delay: Duration::from_millis(self.settings.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.settings.retry_max_delay_ms),
            jitter: self.settings.retry_jitter,
        }
    }
}
