//! In-memory usage recorder: a fixed-capacity ring that evicts the oldest
//! record once full. One record per terminal request outcome.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    Canceled,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub trace_id: String,
    pub api_key_name: String,
    pub api_type: String,
    pub incoming_model: String,
    pub selected_model: String,
    pub provider: String,
    pub status: ResponseStatus,
    pub duration_ms: u64,
    pub usage: Usage,
}

#[derive(Debug)]
pub struct UsageRecorder {
    inner: RwLock<Ring>,
}

#[derive(Debug)]
struct Ring {
    slots: Vec<UsageRecord>,
    head: usize,
    capacity: usize,
}

impl UsageRecorder {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { 1000 } else { capacity };
        Self {
            inner: RwLock::new(Ring {
                slots: Vec::with_capacity(capacity),
                head: 0,
                capacity,
            }),
        }
    }

    pub fn add(&self, record: UsageRecord) {
        let Ok(mut ring) = self.inner.write() else {
            return;
        };
        if ring.slots.len() < ring.capacity {
            ring.slots.push(record);
        } else {
            let head = ring.head;
            ring.slots[head] = record;
            ring.head = (head + 1) % ring.capacity;
        }
    }

    /// Most-recent-first. `limit` of zero returns everything retained.
    pub fn list(&self, limit: usize) -> Vec<UsageRecord> {
        let Ok(ring) = self.inner.read() else {
            return Vec::new();
        };
        let mut records: Vec<UsageRecord> = if ring.slots.len() < ring.capacity {
            ring.slots.clone()
        } else {
            ring.slots[ring.head..]
                .iter()
                .chain(ring.slots[..ring.head].iter())
                .cloned()
                .collect()
        };
        records.reverse();
        if limit > 0 {
            records.truncate(limit);
        }
        records
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|ring| ring.slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
