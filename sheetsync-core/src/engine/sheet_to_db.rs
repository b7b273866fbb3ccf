//! Spreadsheet→Table worker: one directional run of one cycle.
//!
//! Protocol per run:
//! 1. Open a `running` history row.
//! 2. Conditional-read the sheet with the stored ETag; a 304 ends the run.
//! 3. Project the grid to rows (row 1 is headers) and diff against the
//!    current table.
//! 4. Consult the table-side change log for conflicts and arbitrate them.
//! 5. Gate on the idempotency store, then apply the surviving changes in one
//!    transaction tagged `from_sheet`.
//! 6. Advance the sheet-side sync state and finalize the history row.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use super::{CycleOutcome, EngineContext, SyncError};
use crate::config::SyncConfig;
use crate::conflict::{apply_resolutions, detect_conflicts, resolve};
use crate::detect::{detect_changes, ChangeSet};
use crate::events::SyncEvent;
use crate::store::{ConflictRecord, HistoryOutcome, HistoryStatus, SyncDirection, SyncHistory};
use crate::target::FROM_SHEET_TAG;

pub async fn run(ctx: &EngineContext, config: &SyncConfig) -> Result<CycleOutcome, SyncError> {
    let history = SyncHistory::begin(&config.id, SyncDirection::SheetToDb);
    ctx.store.create_history(&history).await?;
    ctx.events.emit(SyncEvent::CycleStarted {
        config_id: config.id.clone(),
        direction: SyncDirection::SheetToDb,
    });
    let started = Instant::now();

    match run_inner(ctx, config).await {
        Ok(outcome) => {
            let status = if outcome.skipped > 0 {
                HistoryStatus::Partial
            } else {
                HistoryStatus::Success
            };
            ctx.store
                .finalize_history(
                    &history.id,
                    HistoryOutcome {
                        status,
                        rows_affected: outcome.rows_affected as i64,
                        conflicts_detected: outcome.conflicts as i64,
                        error: None,
                        metadata: json!({
                            "note": outcome.note,
                            "skipped_rows": outcome.skipped,
                        }),
                    },
                )
                .await?;

            let duration_ms = started.elapsed().as_millis() as u64;
            ctx.events.emit(SyncEvent::CycleCompleted {
                config_id: config.id.clone(),
                direction: SyncDirection::SheetToDb,
                rows_affected: outcome.rows_affected,
                conflicts: outcome.conflicts,
                duration_ms,
            });
            ctx.metrics.incr_counter(
                "sync_cycles",
                &[
                    ("direction", SyncDirection::SheetToDb.as_str()),
                    ("status", status.as_str()),
                ],
            );
            ctx.metrics.observe_histogram(
                "cycle_duration_ms",
                duration_ms as f64,
                &[("direction", SyncDirection::SheetToDb.as_str())],
            );
            Ok(outcome)
        }
        Err(e) => {
            // Report the cycle's failure even if the bookkeeping write fails.
            if let Err(finalize_err) = ctx
                .store
                .finalize_history(&history.id, HistoryOutcome::failed(e.to_string()))
                .await
            {
                warn!(
                    config_id = %config.id,
                    error = %finalize_err,
                    "failed to finalize history row"
                );
            }
            ctx.events.emit(SyncEvent::CycleFailed {
                config_id: config.id.clone(),
                direction: SyncDirection::SheetToDb,
                error: e.to_string(),
            });
            ctx.metrics.incr_counter(
                "sync_cycles",
                &[
                    ("direction", SyncDirection::SheetToDb.as_str()),
                    ("status", "failed"),
                ],
            );
            Err(e)
        }
    }
}

async fn run_inner(ctx: &EngineContext, config: &SyncConfig) -> Result<CycleOutcome, SyncError> {
    let target = ctx.target_for(config).await?;
    let state = ctx.store.get_state(&config.id).await?;
    let pk = config.mapping.primary_key_column();

    let read = ctx
        .sheets
        .read_range(
            &config.spreadsheet_id,
            &config.range,
            state.sheet_etag.as_deref(),
        )
        .await?;

    if read.not_modified {
        // A successful conditional poll still counts as a sync.
        ctx.store
            .update_sheet_sync_state(&config.id, Utc::now(), state.sheet_etag.clone())
            .await?;
        return Ok(CycleOutcome::no_changes("sheet unchanged (etag match)"));
    }

    let grid = read.grid.unwrap_or_default();
    if grid.len() <= 1 {
        // Empty or header-only sheet. Never interpreted as "delete
        // everything": a transient empty read must not wipe the table.
        info!(config_id = %config.id, "sheet empty or header-only, nothing to import");
        ctx.store
            .update_sheet_sync_state(
                &config.id,
                Utc::now(),
                read.etag.clone().or(state.sheet_etag),
            )
            .await?;
        return Ok(CycleOutcome::no_changes("sheet empty or header-only"));
    }
    let projected = config.mapping.project_grid(&grid);

    let table_rows = target.fetch_rows(&config.target_table, &config.mapping).await?;
    let changes = detect_changes(&projected.rows, &table_rows, pk, &HashSet::new());

    if changes.is_empty() {
        ctx.store
            .update_sheet_sync_state(
                &config.id,
                Utc::now(),
                read.etag.clone().or(state.sheet_etag),
            )
            .await?;
        return Ok(CycleOutcome {
            skipped: projected.skipped as u64,
            ..CycleOutcome::no_changes("no differences detected")
        });
    }

    // Table-side changes since the last Table→Spreadsheet sync are the other
    // half of conflict detection.
    let table_changes = target
        .fetch_change_log_since(&config.target_table, FROM_SHEET_TAG, state.last_db_sync_at)
        .await?;
    let sheet_changed_at = read.last_modified.unwrap_or_else(Utc::now);
    let conflicts = detect_conflicts(
        &changes,
        &table_changes,
        sheet_changed_at,
        state.last_db_sync_at,
        pk,
    );

    let mut resolutions = Vec::with_capacity(conflicts.len());
    for conflict in conflicts {
        let resolution = resolve(config.conflict_policy, &conflict);
        let record = ConflictRecord::from_resolution(
            &config.id,
            &conflict,
            config.conflict_policy,
            &resolution,
        );
        ctx.store.insert_conflict(&record).await?;
        ctx.events.emit(SyncEvent::ConflictDetected {
            config_id: config.id.clone(),
            row_key: conflict.row_key.clone(),
            strategy: config.conflict_policy.as_str().to_string(),
            winner: resolution.winner.as_str().to_string(),
        });
        ctx.metrics.incr_counter(
            "sync_conflicts",
            &[
                ("strategy", config.conflict_policy.as_str()),
                ("winner", resolution.winner.as_str()),
            ],
        );
        resolutions.push((conflict, resolution));
    }
    let conflict_count = resolutions.len() as u64;

    let changes = apply_resolutions(changes, &resolutions, pk);
    if changes.is_empty() {
        ctx.store
            .update_sheet_sync_state(
                &config.id,
                Utc::now(),
                read.etag.clone().or(state.sheet_etag.clone()),
            )
            .await?;
        return Ok(CycleOutcome {
            conflicts: conflict_count,
            skipped: projected.skipped as u64,
            ..CycleOutcome::no_changes("all changes dropped by conflict resolution")
        });
    }

    let op_id = derive_op_id(config, read.etag.as_deref(), &changes);
    if !ctx.idempotency.check_and_mark(&op_id).await? {
        info!(config_id = %config.id, op_id = %op_id, "cycle already processed, skipping");
        return Ok(CycleOutcome {
            conflicts: conflict_count,
            skipped: projected.skipped as u64,
            ..CycleOutcome::no_changes("cycle already processed")
        });
    }

    let rows_affected = target
        .apply_changes(
            &config.target_table,
            &config.mapping,
            &changes,
            Some(FROM_SHEET_TAG),
        )
        .await?;

    ctx.idempotency
        .mark_processed(
            &op_id,
            json!({
                "rows_affected": rows_affected,
                "inserts": changes.inserts.len(),
                "updates": changes.updates.len(),
                "deletes": changes.deletes.len(),
                "conflicts": conflict_count,
            }),
        )
        .await?;

    ctx.store
        .update_sheet_sync_state(
            &config.id,
            Utc::now(),
            read.etag.clone().or(state.sheet_etag),
        )
        .await?;

    info!(
        config_id = %config.id,
        rows_affected,
        conflicts = conflict_count,
        "spreadsheet changes applied to table"
    );

    Ok(CycleOutcome {
        rows_affected,
        conflicts: conflict_count,
        skipped: projected.skipped as u64,
        note: None,
    })
}

/// Op id for one Spreadsheet→Table cycle: config, direction, and a
/// fingerprint of the inputs, so an identical replayed cycle collides in the
/// idempotency store while genuinely new work does not.
fn derive_op_id(config: &SyncConfig, etag: Option<&str>, changes: &ChangeSet) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    etag.unwrap_or("").hash(&mut hasher);
    serde_json::to_string(changes)
        .unwrap_or_default()
        .hash(&mut hasher);
    format!(
        "{}:{}:{:016x}",
        config.id,
        SyncDirection::SheetToDb.as_str(),
        hasher.finish()
    )
}
