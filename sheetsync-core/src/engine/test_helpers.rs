//! Shared fixtures for the engine tests: an in-memory sheet, an on-disk
//! SQLite target with CDC installed, and in-memory metadata/idempotency/
//! event/metric sinks wired into one context.

use std::sync::Arc;

use tempfile::TempDir;

use super::EngineContext;
use crate::config::{ColumnMapping, ConflictPolicy, EngineSettings, SyncConfig};
use crate::dlq::DeadLetterQueue;
use crate::events::MemoryEventSink;
use crate::idempotency::MemoryIdempotencyStore;
use crate::metrics::MemoryMetrics;
use crate::sheet::memory::InMemorySheet;
use crate::store::memory::MemoryMetadataStore;
use crate::store::MetadataStore;
use crate::target::TargetDb;
use crate::value::{CellValue, Row};

pub(crate) struct Fixture {
    // Held for the lifetime of the target database file.
    #[allow(dead_code)]
    pub dir: TempDir,
    pub ctx: Arc<EngineContext>,
    pub sheet: Arc<InMemorySheet>,
    pub store: Arc<MemoryMetadataStore>,
    pub events: Arc<MemoryEventSink>,
    pub metrics: Arc<MemoryMetrics>,
    pub dlq: Arc<DeadLetterQueue>,
    pub target: TargetDb,
    pub config: SyncConfig,
}

pub(crate) fn text(s: &str) -> CellValue {
    CellValue::Text(s.to_string())
}

pub(crate) fn mapping() -> ColumnMapping {
    ColumnMapping::new(vec![
        ('A', "id".into()),
        ('B', "name".into()),
        ('C', "email".into()),
    ])
    .expect("mapping")
}

/// Header plus the two canonical seed rows.
pub(crate) fn seeded_grid() -> Vec<Vec<CellValue>> {
    vec![
        vec![text("id"), text("name"), text("email")],
        vec![text("1"), text("Alice"), text("alice@x")],
        vec![text("2"), text("Bob"), text("bob@x")],
    ]
}

pub(crate) async fn fixture() -> Fixture {
    fixture_with_policy(ConflictPolicy::LastWriteWins).await
}

pub(crate) async fn fixture_with_policy(policy: ConflictPolicy) -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("target.db").display()
    );
    let target = TargetDb::connect(&url).await.expect("connect target");
    sqlx::query("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT)")
        .execute(target.pool())
        .await
        .expect("create target table");
    target
        .install_cdc("users", &mapping())
        .await
        .expect("install cdc");

    let config = SyncConfig {
        id: "cfg-1".into(),
        name: "users sync".into(),
        spreadsheet_id: "sheet-1".into(),
        range: "Sheet1".into(),
        target_db_url: url.clone(),
        target_table: "users".into(),
        mapping: mapping(),
        conflict_policy: policy,
        sync_interval_secs: 30,
        active: true,
    };

    let sheet = Arc::new(InMemorySheet::new());
    let store = Arc::new(MemoryMetadataStore::new());
    store.upsert_config(&config).await.expect("upsert config");
    let events = Arc::new(MemoryEventSink::default());
    let metrics = Arc::new(MemoryMetrics::default());
    let dlq = Arc::new(DeadLetterQueue::default());

    let settings = EngineSettings {
        tick_interval_secs: 1,
        max_retry_attempts: 3,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 4,
        retry_jitter: false,
        change_log_batch: 1000,
    };

    let ctx = Arc::new(EngineContext::new(
        store.clone(),
        sheet.clone(),
        Arc::new(MemoryIdempotencyStore::default()),
        events.clone(),
        metrics.clone(),
        dlq.clone(),
        settings,
    ));
    ctx.register_target(&url, target.clone()).await;

    Fixture {
        dir,
        ctx,
        sheet,
        store,
        events,
        metrics,
        dlq,
        target,
        config,
    }
}

pub(crate) async fn table_rows(f: &Fixture) -> Vec<Row> {
    f.target
        .fetch_rows(&f.config.target_table, &f.config.mapping)
        .await
        .expect("fetch rows")
}
