//! Orchestrator: the periodic driver of sync cycles.
//!
//! Each tick lists the active configs and, per config, runs whichever
//! directions are due. Spreadsheet→Table always precedes Table→Spreadsheet
//! within a config; running them the other way around could re-emit rows the
//! cycle is about to write back. A run that exhausts its retries is
//! dead-lettered and the tick moves on to the next config.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use super::{db_to_sheet, sheet_to_db, EngineContext, SyncError};
use crate::config::SyncConfig;
use crate::dlq::DeadLetter;
use crate::events::SyncEvent;
use crate::retry::retry_with_backoff;
use crate::store::SyncDirection;

pub struct Orchestrator {
    ctx: Arc<EngineContext>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Orchestrator {
            ctx,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Launch the periodic tick. The first cycle runs immediately.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let ctx = self.ctx.clone();
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(ctx.settings.tick_interval_secs));
            loop {
                interval.tick().await;
                // The stop flag is honored between ticks; an in-flight cycle
                // always runs to completion.
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                tick(&ctx).await;
            }
            info!("orchestrator stopped");
        });

        *self.handle.lock().expect("orchestrator lock") = Some(handle);
        info!(
            tick_interval_secs = self.ctx.settings.tick_interval_secs,
            "orchestrator started"
        );
    }

    /// Clear the running flag. The tick task exits at its next wakeup.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run every active config once, regardless of the tick schedule.
    pub async fn run_tick(&self) {
        tick(&self.ctx).await;
    }

    /// Manual trigger: run exactly one config now, bypassing the interval
    /// check. Worker failures are dead-lettered the same way a scheduled run
    /// dead-letters them.
    pub async fn trigger_config(&self, config_id: &str) -> Result<(), SyncError> {
        let config = self
            .ctx
            .store
            .get_config(config_id)
            .await?
            .ok_or_else(|| SyncError::UnknownConfig(config_id.to_string()))?;
        run_config(&self.ctx, &config, true).await;
        Ok(())
    }
}

async fn tick(ctx: &Arc<EngineContext>) {
    let configs = match ctx.store.list_active_configs().await {
        Ok(configs) => configs,
        Err(e) => {
            error!(error = %e, "failed to list active configs, skipping tick");
            return;
        }
    };

    for config in &configs {
        run_config(ctx, config, false).await;
    }

    ctx.metrics
        .set_gauge("dlq_depth", ctx.dlq.depth() as f64, &[]);
}

/// Run the due directions of one config. Failures are contained here so one
/// broken config never aborts the tick.
async fn run_config(ctx: &EngineContext, config: &SyncConfig, force: bool) {
    let state = match ctx.store.get_state(&config.id).await {
        Ok(state) => state,
        Err(e) => {
            error!(config_id = %config.id, error = %e, "failed to read sync state");
            return;
        }
    };

    let now = Utc::now();
    let interval = chrono::Duration::seconds(config.sync_interval_secs as i64);
    let sheet_due = force
        || state
            .last_sheet_sync_at
            .map(|t| now - t >= interval)
            .unwrap_or(true);
    let table_due = force
        || state
            .last_db_sync_at
            .map(|t| now - t >= interval)
            .unwrap_or(true);

    // Sheet→Table first, then Table→Spreadsheet. The order is a correctness
    // requirement, not a preference.
    if sheet_due {
        run_direction(ctx, config, SyncDirection::SheetToDb).await;
    }
    if table_due {
        run_direction(ctx, config, SyncDirection::DbToSheet).await;
    }
}

async fn run_direction(ctx: &EngineContext, config: &SyncConfig, direction: SyncDirection) {
    let policy = ctx.retry_policy();
    let label = format!("{} {}", config.id, direction.as_str());
    let first_attempt_at = Utc::now();

    let result = retry_with_backoff(&policy, &label, SyncError::is_retryable, || async {
        match direction {
            SyncDirection::SheetToDb => sheet_to_db::run(ctx, config).await,
            SyncDirection::DbToSheet => db_to_sheet::run(ctx, config).await,
        }
    })
    .await;

    let Err(e) = result else {
        return;
    };

    let failure_reason = e.failure_reason();
    let attempts_made = if e.is_retryable() {
        policy.max_attempts
    } else {
        1
    };
    let job_id = Uuid::new_v4().to_string();

    error!(
        config_id = %config.id,
        direction = direction.as_str(),
        error = %e,
        attempts = attempts_made,
        "sync direction failed, dead-lettering"
    );

    ctx.dlq.push(DeadLetter {
        job_id: job_id.clone(),
        payload: json!({
            "config_id": config.id,
            "direction": direction.as_str(),
        }),
        error: e.to_string(),
        stack_trace: Some(format!("{e:?}")),
        attempts_made,
        first_attempt_at,
        last_attempt_at: Utc::now(),
        failure_reason,
    });
    ctx.events.emit(SyncEvent::DeadLettered {
        config_id: config.id.clone(),
        job_id,
        failure_reason: failure_reason.as_str().to_string(),
    });
    ctx.metrics
        .set_gauge("dlq_depth", ctx.dlq.depth() as f64, &[]);
}
