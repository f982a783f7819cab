//! Per-queue bounded message history.
//!
//! Shape grounded on the teacher's `broker::ring_buffer::RingBuffer`
//! (fixed-capacity, evict-oldest `VecDeque`), generalized here from a byte
//! ring to one `VecDeque<Value>` per queue, capped at [`HISTORY_CAPACITY`]
//! entries.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde_json::Value;

/// Maximum number of retained messages per queue (spec: N = 10).
pub const HISTORY_CAPACITY: usize = 10;

/// Registry of per-queue history rings, keyed by queue name.
#[derive(Default)]
pub struct HistoryStore {
    queues: Mutex<HashMap<String, VecDeque<Value>>>,
}

impl HistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message` to `queue`'s ring, evicting the oldest entry if the
    /// ring is already at capacity. Creates the ring on first write.
    pub fn push(&self, queue: &str, message: Value) {
        let mut queues = self.queues.lock().unwrap();
        let ring = queues.entry(queue.to_string()).or_default();
        if ring.len() >= HISTORY_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(message);
    }

    /// Return an oldest→newest snapshot of `queue`'s history, or `None` if
    /// the queue has never been published to. The snapshot is an
    /// independent copy: later writes never mutate it.
    #[must_use]
    pub fn snapshot(&self, queue: &str) -> Option<Vec<Value>> {
        let queues = self.queues.lock().unwrap();
        queues.get(queue).map(|ring| ring.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_queue_returns_none() {
        let store = HistoryStore::new();
        assert!(store.snapshot("never-published").is_none());
    }

    #[test]
    fn test_retains_last_n_oldest_to_newest() {
        let store = HistoryStore::new();
        for i in 0..12 {
            store.push("q2", json!({"i": i}));
        }
        let snapshot = store.snapshot("q2").unwrap();
        assert_eq!(snapshot.len(), HISTORY_CAPACITY);
        assert_eq!(snapshot.first().unwrap(), &json!({"i": 2}));
        assert_eq!(snapshot.last().unwrap(), &json!({"i": 11}));
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let store = HistoryStore::new();
        store.push("q1", json!({"i": 0}));
        let snapshot = store.snapshot("q1").unwrap();
        store.push("q1", json!({"i": 1}));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_separate_queues_are_independent() {
        let store = HistoryStore::new();
        store.push("a", json!(1));
        assert!(store.snapshot("b").is_none());
        assert_eq!(store.snapshot("a").unwrap(), vec![json!(1)]);
    }
}
