//! Dead-letter queue: a bounded log of sync jobs that exhausted their
//! retries. When the bound is exceeded the oldest entry is evicted.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const DEFAULT_DLQ_CAPACITY: usize = 1000;

/// Why a job ended up in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MaxRetries,
    NonRetryable,
    Timeout,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::MaxRetries => "max_retries",
            FailureReason::NonRetryable => "non_retryable",
            FailureReason::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub job_id: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub stack_trace: Option<String>,
    pub attempts_made: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub failure_reason: FailureReason,
}

#[derive(Debug)]
pub struct DeadLetterQueue {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetter>>,
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        DeadLetterQueue::new(DEFAULT_DLQ_CAPACITY)
    }
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        DeadLetterQueue {
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, letter: DeadLetter) {
        let mut entries = self.entries.lock().expect("dlq lock");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(letter);
    }

    pub fn depth(&self) -> usize {
        self.entries.lock().expect("dlq lock").len()
    }

    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .expect("dlq lock")
            .iter()
            .cloned()
            .collect()
    }

    /// Remove and return an entry so the caller can re-enqueue it.
    /// Actual re-execution is left to the caller.
    pub fn take(&self, job_id: &str) -> Option<DeadLetter> {
        let mut entries = self.entries.lock().expect("dlq lock");
        let idx = entries.iter().position(|e| e.job_id == job_id)?;
        entries.remove(idx)
    }
}
