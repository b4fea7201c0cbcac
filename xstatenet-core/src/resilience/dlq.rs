//! Bounded in-memory dead-letter sink. Shared by the orchestrator (events
//! undelivered at shutdown, bubbled invocation errors) and the timeout
//! protector (cancelled handlings).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub machine_id: String,
    pub event_name: String,
    pub payload: Value,
    /// Stable error tag (`Error::kind` or a transport-level reason).
    pub error_kind: String,
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
}

pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    capacity: usize,
    /// Entries evicted to make room; they are gone for good.
    evicted: AtomicU64,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn push(
        &self,
        machine_id: impl Into<String>,
        event_name: impl Into<String>,
        payload: Value,
        error_kind: impl Into<String>,
        error: impl Into<String>,
    ) -> Uuid {
        let entry = DeadLetterEntry {
            id: Uuid::now_v7(),
            machine_id: machine_id.into(),
            event_name: event_name.into(),
            payload,
            error_kind: error_kind.into(),
            error: error.into(),
            created_at: Utc::now(),
            attempts: 0,
        };
        let id = entry.id;
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        tracing::warn!(
            machine = %entry.machine_id,
            event = %entry.event_name,
            kind = %entry.error_kind,
            "dead-lettered event"
        );
        entries.push_back(entry);
        id
    }

    /// Oldest entry first.
    pub fn take(&self) -> Option<DeadLetterEntry> {
        self.entries.lock().pop_front()
    }

    pub fn list(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(10_000)
    }
}
