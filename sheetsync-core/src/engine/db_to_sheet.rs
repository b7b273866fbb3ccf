//! Table→Spreadsheet worker: one directional run of one cycle.
//!
//! Consumes the unprocessed change-log entries for the config's table,
//! skipping `from_sheet` rows so nothing the other direction wrote comes
//! back around. Entries are walked in id order: rows present in the sheet
//! become batch updates, absent rows become appends (an UPDATE with no sheet
//! row appends too), and DELETE clears the row's cells, which is as close to
//! row removal as the platform allows.

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use super::{CycleOutcome, EngineContext, SyncError};
use crate::config::SyncConfig;
use crate::detect::row_key;
use crate::events::SyncEvent;
use crate::sheet::{row_range, RangeUpdate};
use crate::store::{HistoryOutcome, HistoryStatus, SyncDirection, SyncHistory};
use crate::target::{ChangeLogEntry, ChangeOp, FROM_SHEET_TAG};
use crate::value::CellValue;

pub async fn run(ctx: &EngineContext, config: &SyncConfig) -> Result<CycleOutcome, SyncError> {
    let history = SyncHistory::begin(&config.id, SyncDirection::DbToSheet);
    ctx.store.create_history(&history).await?;
    ctx.events.emit(SyncEvent::CycleStarted {
        config_id: config.id.clone(),
        direction: SyncDirection::DbToSheet,
    });
    let started = Instant::now();

    match run_inner(ctx, config).await {
        Ok(outcome) => {
            ctx.store
                .finalize_history(
                    &history.id,
                    HistoryOutcome {
                        status: HistoryStatus::Success,
                        rows_affected: outcome.rows_affected as i64,
                        conflicts_detected: 0,
                        error: None,
                        metadata: json!({ "note": outcome.note }),
                    },
                )
                .await?;

            let duration_ms = started.elapsed().as_millis() as u64;
            ctx.events.emit(SyncEvent::CycleCompleted {
                config_id: config.id.clone(),
                direction: SyncDirection::DbToSheet,
                rows_affected: outcome.rows_affected,
                conflicts: 0,
                duration_ms,
            });
            ctx.metrics.incr_counter(
                "sync_cycles",
                &[
                    ("direction", SyncDirection::DbToSheet.as_str()),
                    ("status", "success"),
                ],
            );
            ctx.metrics.observe_histogram(
                "cycle_duration_ms",
                duration_ms as f64,
                &[("direction", SyncDirection::DbToSheet.as_str())],
            );
            Ok(outcome)
        }
        Err(e) => {
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
                direction: SyncDirection::DbToSheet,
                error: e.to_string(),
            });
            ctx.metrics.incr_counter(
                "sync_cycles",
                &[
                    ("direction", SyncDirection::DbToSheet.as_str()),
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
    let width = config.mapping.width();

    let entries = target
        .fetch_change_log(
            &config.target_table,
            FROM_SHEET_TAG,
            ctx.settings.change_log_batch,
        )
        .await?;
    if entries.is_empty() {
        // An empty scan is still a completed poll; advancing the timestamp
        // keeps the orchestrator's due computation honest. The change-id
        // cursor is untouched.
        ctx.store
            .update_db_sync_state(&config.id, Utc::now(), state.db_last_change_id)
            .await?;
        return Ok(CycleOutcome::no_changes("no table changes to propagate"));
    }

    let read = ctx
        .sheets
        .read_range(&config.spreadsheet_id, &config.range, None)
        .await?;
    let grid = read.grid.unwrap_or_default();
    let needs_header = grid.is_empty();

    // Primary key -> 1-based sheet row. Row 1 is the header.
    let mut index: HashMap<String, usize> = HashMap::new();
    for (i, cells) in grid.iter().enumerate().skip(1) {
        if let Some(cell) = cells.first() {
            if !cell.is_empty() {
                index.insert(cell.display_string().trim().to_string(), i + 1);
            }
        }
    }

    let plan = classify_entries(&entries, &mut index, &config.mapping, pk);

    let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
    let first_id = ids.first().copied().unwrap_or(0);
    let last_id = ids.last().copied().unwrap_or(0);
    let op_id = format!(
        "{}:{}:{}-{}",
        config.id,
        SyncDirection::DbToSheet.as_str(),
        first_id,
        last_id
    );

    if !ctx.idempotency.check_and_mark(&op_id).await? {
        // An identical run already pushed these rows to the sheet; consume
        // the batch so the log drains, but write nothing.
        info!(config_id = %config.id, op_id = %op_id, "batch already processed, consuming");
        target.mark_changes_processed(&ids).await?;
        ctx.store
            .update_db_sync_state(&config.id, Utc::now(), Some(last_id))
            .await?;
        return Ok(CycleOutcome::no_changes("batch already processed"));
    }

    if !plan.updates.is_empty() {
        let range_updates: Vec<RangeUpdate> = plan
            .updates
            .iter()
            .map(|(row, cells)| RangeUpdate {
                range: row_range(&config.range, *row, width),
                values: vec![cells.clone()],
            })
            .collect();
        ctx.sheets
            .batch_update(&config.spreadsheet_id, &range_updates)
            .await?;
    }

    if !plan.appends.is_empty() {
        let mut rows: Vec<Vec<CellValue>> = Vec::with_capacity(plan.appends.len() + 1);
        if needs_header {
            rows.push(
                config
                    .mapping
                    .column_names()
                    .map(|c| CellValue::Text(c.to_string()))
                    .collect(),
            );
        }
        rows.extend(plan.appends.iter().map(|(_, cells)| cells.clone()));
        ctx.sheets
            .append_rows(&config.spreadsheet_id, &config.range, &rows)
            .await?;
    }

    for row in &plan.clears {
        ctx.sheets
            .clear_range(
                &config.spreadsheet_id,
                &row_range(&config.range, *row, width),
            )
            .await?;
    }

    let consumed = target.mark_changes_processed(&ids).await?;
    let rows_affected = (plan.updates.len() + plan.appends.len() + plan.clears.len()) as u64;

    ctx.idempotency
        .mark_processed(
            &op_id,
            json!({
                "rows_affected": rows_affected,
                "entries_consumed": consumed,
                "first_change_id": first_id,
                "last_change_id": last_id,
            }),
        )
        .await?;

    ctx.store
        .update_db_sync_state(&config.id, Utc::now(), Some(last_id))
        .await?;

    info!(
        config_id = %config.id,
        rows_affected,
        entries = entries.len(),
        "table changes propagated to spreadsheet"
    );

    Ok(CycleOutcome {
        rows_affected,
        conflicts: 0,
        skipped: 0,
        note: None,
    })
}

/// The spreadsheet writes one change-log batch boils down to.
#[derive(Debug, Default)]
struct WritePlan {
    /// 1-based sheet row -> full cell row, deduplicated (last change wins).
    updates: Vec<(usize, Vec<CellValue>)>,
    /// Appended rows keyed by primary key, deduplicated the same way.
    appends: Vec<(String, Vec<CellValue>)>,
    /// 1-based sheet rows whose cells get cleared.
    clears: Vec<usize>,
}

/// Walk entries in id order and fold them into a write plan. `index` tracks
/// key -> sheet row and loses entries as rows are cleared, so a later
/// re-insert of a deleted key appends instead of resurrecting the cleared
/// row.
fn classify_entries(
    entries: &[ChangeLogEntry],
    index: &mut HashMap<String, usize>,
    mapping: &crate::config::ColumnMapping,
    pk: &str,
) -> WritePlan {
    let mut plan = WritePlan::default();

    for entry in entries {
        let Some(key) = row_key(&entry.row, pk) else {
            warn!(change_id = entry.id, "change-log row has no usable primary key, skipping");
            continue;
        };

        match entry.op {
            ChangeOp::Insert | ChangeOp::Update => {
                let cells = mapping.row_to_cells(&entry.row);
                if let Some(&row) = index.get(&key) {
                    match plan.updates.iter_mut().find(|(r, _)| *r == row) {
                        Some(slot) => slot.1 = cells,
                        None => plan.updates.push((row, cells)),
                    }
                } else {
                    match plan.appends.iter_mut().find(|(k, _)| *k == key) {
                        Some(slot) => slot.1 = cells,
                        None => plan.appends.push((key, cells)),
                    }
                }
            }
            ChangeOp::Delete => {
                if let Some(row) = index.remove(&key) {
                    plan.updates.retain(|(r, _)| *r != row);
                    plan.clears.push(row);
                } else {
                    // Deleted before it ever reached the sheet (or appended
                    // earlier in this very batch): nothing to clear.
                    plan.appends.retain(|(k, _)| *k != key);
                }
            }
        }
    }

    plan
}
