use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// One recorded inbound request, as served on `/_history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub method: String,
    pub uri: String,
    pub body: String,
}

#[derive(Debug, Default)]
struct RingState {
    slots: Vec<HistoryRecord>,
    /// Next slot to overwrite once the ring is full; also the oldest
    /// record's position at that point.
    cursor: usize,
}

/// Fixed-capacity ring of the last N raw requests, kept for test
/// introspection. A full ring silently overwrites its oldest record.
#[derive(Debug)]
pub struct HistoryRing {
    capacity: usize,
    state: Mutex<RingState>,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(RingState::default()),
        }
    }

    /// O(1); holds the lock only for the cursor/slot read-modify-write.
    /// Capacity zero makes this a no-op.
    pub fn record(&self, method: &str, uri: &str, body: &str) {
        if self.capacity == 0 {
            return;
        }
        let record = HistoryRecord {
            method: method.to_string(),
            uri: uri.to_string(),
            body: body.to_string(),
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.slots.len() < self.capacity {
            state.slots.push(record);
        } else {
            let cursor = state.cursor;
            state.slots[cursor] = record;
            state.cursor = (cursor + 1) % self.capacity;
        }
    }

    /// Copy of every populated slot, oldest first.
    pub fn snapshot(&self) -> Vec<HistoryRecord> {
        if self.capacity == 0 {
            return Vec::new();
        }
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.slots.len() < self.capacity {
            return state.slots.clone();
        }
        let (newest, oldest) = state.slots.split_at(state.cursor);
        oldest.iter().chain(newest).cloned().collect()
    }
}
