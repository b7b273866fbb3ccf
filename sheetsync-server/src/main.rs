//! sheetsync headless server.
//!
//! Loads sync configurations from a YAML file, installs change-capture
//! triggers on each target table, and runs the periodic orchestrator until
//! interrupted. The HTTP management surface lives elsewhere; this binary is
//! only the sync engine.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sheetsync_core::config::{EngineSettings, SyncConfig};
use sheetsync_core::dlq::DeadLetterQueue;
use sheetsync_core::engine::orchestrator::Orchestrator;
use sheetsync_core::engine::EngineContext;
use sheetsync_core::events::LogEventSink;
use sheetsync_core::idempotency::MemoryIdempotencyStore;
use sheetsync_core::metrics::NoopMetrics;
use sheetsync_core::sheet::http::HttpSheetClient;
use sheetsync_core::store::sqlite::SqliteMetadataStore;
use sheetsync_core::store::MetadataStore;
use sheetsync_core::target::TargetDb;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "sheetsync-server")]
struct Args {
    /// YAML file holding the sync configurations to load at startup.
    #[arg(long, env = "SHEETSYNC_CONFIG_FILE")]
    config_file: PathBuf,

    /// SQLite URL for configs, sync state, history and conflicts.
    #[arg(
        long,
        default_value = "sqlite://sheetsync.db?mode=rwc",
        env = "SHEETSYNC_METADATA_DB"
    )]
    metadata_db: String,

    /// Base URL of the spreadsheet values API.
    #[arg(long, env = "SHEETSYNC_SHEETS_BASE_URL")]
    sheets_base_url: String,

    /// Bearer token for the spreadsheet API.
    #[arg(long, env = "SHEETSYNC_SHEETS_TOKEN")]
    sheets_token: Option<String>,

    /// Orchestrator tick interval in seconds.
    #[arg(long, default_value = "10", env = "SHEETSYNC_TICK_INTERVAL")]
    tick_interval: u64,

    /// Retry attempts per directional run.
    #[arg(long, default_value = "3", env = "SHEETSYNC_MAX_RETRIES")]
    max_retries: u32,

    #[arg(long, default_value = "500", env = "SHEETSYNC_RETRY_BASE_DELAY_MS")]
    retry_base_delay_ms: u64,

    #[arg(long, default_value = "30000", env = "SHEETSYNC_RETRY_MAX_DELAY_MS")]
    retry_max_delay_ms: u64,

    /// Change-log rows consumed per Table→Spreadsheet run.
    #[arg(long, default_value = "1000", env = "SHEETSYNC_CHANGE_LOG_BATCH")]
    change_log_batch: i64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let raw = tokio::fs::read_to_string(&args.config_file).await?;
    let configs: Vec<SyncConfig> = serde_yaml::from_str(&raw)?;
    info!(count = configs.len(), file = %args.config_file.display(), "loaded sync configs");

    let store = Arc::new(SqliteMetadataStore::open(&args.metadata_db).await?);

    let settings = EngineSettings {
        tick_interval_secs: args.tick_interval,
        max_retry_attempts: args.max_retries,
        retry_base_delay_ms: args.retry_base_delay_ms,
        retry_max_delay_ms: args.retry_max_delay_ms,
        retry_jitter: true,
        change_log_batch: args.change_log_batch,
    };

    let ctx = Arc::new(EngineContext::new(
        store.clone(),
        Arc::new(HttpSheetClient::new(args.sheets_base_url, args.sheets_token)),
        Arc::new(MemoryIdempotencyStore::default()),
        Arc::new(LogEventSink),
        Arc::new(NoopMetrics),
        Arc::new(DeadLetterQueue::default()),
        settings,
    ));

    for config in &configs {
        config.validate()?;
        store.upsert_config(config).await?;
        if !config.active {
            info!(config_id = %config.id, "config inactive, skipping trigger install");
            continue;
        }
        let target = TargetDb::connect(&config.target_db_url).await?;
        target
            .install_cdc(&config.target_table, &config.mapping)
            .await?;
        ctx.register_target(&config.target_db_url, target).await;
        info!(
            config_id = %config.id,
            table = %config.target_table,
            "change capture installed"
        );
    }

    let orchestrator = Orchestrator::new(ctx);
    orchestrator.start();

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, stopping after in-flight cycles");
    orchestrator.stop();
    Ok(())
}
