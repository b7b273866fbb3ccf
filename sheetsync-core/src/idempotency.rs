//! Idempotency guard: a keyed set of already-processed operation ids.
//!
//! Workers derive one op id per cycle and direction; `check_and_mark` is the
//! single atomic gate that stops a replayed cycle (orchestrator double-tick,
//! crashed-and-restarted run) from applying its writes twice.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

pub const IDEMPOTENCY_KEY_PREFIX: &str = "idempotency:";

/// Entries live for 24 hours, long enough to outlast any retry storm.
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Error, Debug)]
pub enum IdempotencyError {
    #[error("idempotency backend error: {0}")]
    Backend(String),
}

/// Keyed set with set-if-absent semantics. The production deployment backs
/// this with a shared store (setNX + TTL); the in-memory implementation
/// below covers single-process runs and tests.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically record `op_id`. Returns true iff the id was new.
    async fn check_and_mark(&self, op_id: &str) -> Result<bool, IdempotencyError>;

    async fn is_processed(&self, op_id: &str) -> Result<bool, IdempotencyError>;

    /// Attach summary metadata to an id recorded earlier in the cycle.
    async fn mark_processed(
        &self,
        op_id: &str,
        metadata: serde_json::Value,
    ) -> Result<(), IdempotencyError>;

    async fn get_metadata(
        &self,
        op_id: &str,
    ) -> Result<Option<serde_json::Value>, IdempotencyError>;
}

struct Entry {
    expires_at: Instant,
    metadata: Option<serde_json::Value>,
}

/// Process-local implementation with TTL expiry, purged opportunistically on
/// access.
pub struct MemoryIdempotencyStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        MemoryIdempotencyStore::with_ttl(IDEMPOTENCY_TTL)
    }
}

impl MemoryIdempotencyStore {
    pub fn with_ttl(ttl: Duration) -> Self {
        MemoryIdempotencyStore {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(op_id: &str) -> String {
        format!("{IDEMPOTENCY_KEY_PREFIX}{op_id}")
    }

    fn purge(entries: &mut HashMap<String, Entry>) {
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn check_and_mark(&self, op_id: &str) -> Result<bool, IdempotencyError> {
        let mut entries = self.entries.lock().expect("idempotency lock");
        Self::purge(&mut entries);
        let key = Self::key(op_id);
        if entries.contains_key(&key) {
            return Ok(false);
        }
        entries.insert(
            key,
            Entry {
                expires_at: Instant::now() + self.ttl,
                metadata: None,
            },
        );
        Ok(true)
    }

    async fn is_processed(&self, op_id: &str) -> Result<bool, IdempotencyError> {
        let mut entries = self.entries.lock().expect("idempotency lock");
        Self::purge(&mut entries);
        Ok(entries.contains_key(&Self::key(op_id)))
    }

    async fn mark_processed(
        &self,
        op_id: &str,
        metadata: serde_json::Value,
    ) -> Result<(), IdempotencyError> {
        let mut entries = self.entries.lock().expect("idempotency lock");
        let expires_at = Instant::now() + self.ttl;
        entries
            .entry(Self::key(op_id))
            .and_modify(|e| e.metadata = Some(metadata.clone()))
            .or_insert(Entry {
                expires_at,
                metadata: Some(metadata),
            });
        Ok(())
    }

    async fn get_metadata(
        &self,
        op_id: &str,
    ) -> Result<Option<serde_json::Value>, IdempotencyError> {
        let mut entries = self.entries.lock().expect("idempotency lock");
        Self::purge(&mut entries);
        Ok(entries
            .get(&Self::key(op_id))
            .and_then(|e| e.metadata.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_mark_wins() {
        let store = MemoryIdempotencyStore::default();
        assert!(store.check_and_mark("cfg-1:sheet_to_db:abc").await.unwrap());
        assert!(!store.check_and_mark("cfg-1:sheet_to_db:abc").await.unwrap());
        assert!(store.is_processed("cfg-1:sheet_to_db:abc").await.unwrap());
        assert!(!store.is_processed("other").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_forgotten() {
        let store = MemoryIdempotencyStore::with_ttl(Duration::ZERO);
        assert!(store.check_and_mark("op").await.unwrap());
        assert!(store.check_and_mark("op").await.unwrap());
    }

    #[tokio::test]
    async fn metadata_round_trip() {
        let store = MemoryIdempotencyStore::default();
        store.check_and_mark("op").await.unwrap();
        assert_eq!(store.get_metadata("op").await.unwrap(), None);

        store
            .mark_processed("op", serde_json::json!({"rows": 2}))
            .await
            .unwrap();
        assert_eq!(
            store.get_metadata("op").await.unwrap(),
            Some(serde_json::json!({"rows": 2}))
        );
    }
}
