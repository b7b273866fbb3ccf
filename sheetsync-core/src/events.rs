//! Lifecycle events emitted by the workers and the orchestrator.
//!
//! Sinks are fire-and-forget: a slow or broken observer must never stall a
//! sync cycle. The websocket broadcaster consumed by the dashboard plugs in
//! behind `EventSink`; the default sink just logs.

use std::sync::Mutex;

use serde::Serialize;
use tracing::{error, info};

use crate::store::SyncDirection;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    CycleStarted {
        config_id: String,
        direction: SyncDirection,
    },
    CycleCompleted {
        config_id: String,
        direction: SyncDirection,
        rows_affected: u64,
        conflicts: u64,
        duration_ms: u64,
    },
    CycleFailed {
        config_id: String,
        direction: SyncDirection,
        error: String,
    },
    ConflictDetected {
        config_id: String,
        row_key: String,
        strategy: String,
        winner: String,
    },
    DeadLettered {
        config_id: String,
        job_id: String,
        failure_reason: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

/// Default sink: structured log lines.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: SyncEvent) {
        match &event {
            SyncEvent::CycleStarted {
                config_id,
                direction,
            } => info!(config_id = %config_id, direction = direction.as_str(), "cycle started"),
            SyncEvent::CycleCompleted {
                config_id,
                direction,
                rows_affected,
                conflicts,
                duration_ms,
            } => info!(
                config_id = %config_id,
                direction = direction.as_str(),
                rows_affected,
                conflicts,
                duration_ms,
                "cycle completed"
            ),
            SyncEvent::CycleFailed {
                config_id,
                direction,
                error,
            } => error!(
                config_id = %config_id,
                direction = direction.as_str(),
                error = %error,
                "cycle failed"
            ),
            SyncEvent::ConflictDetected {
                config_id,
                row_key,
                strategy,
                winner,
            } => info!(
                config_id = %config_id,
                row_key = %row_key,
                strategy = %strategy,
                winner = %winner,
                "conflict detected"
            ),
            SyncEvent::DeadLettered {
                config_id,
                job_id,
                failure_reason,
            } => error!(
                config_id = %config_id,
                job_id = %job_id,
                failure_reason = %failure_reason,
                "job dead-lettered"
            ),
        }
    }
}

/// Captures events for assertions in tests.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl MemoryEventSink {
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().expect("event sink lock").clone()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: SyncEvent) {
        self.events.lock().expect("event sink lock").push(event);
    }
}
