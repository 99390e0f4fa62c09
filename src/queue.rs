//! Component H: bounded in-memory telemetry queues.
//!
//! Impressions and events producers never block: once a queue is at
//! capacity, the oldest record is dropped and a counter is incremented
//! (§5 Backpressure, §7 Saturation).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct TelemetryQueue {
    name: &'static str,
    capacity: usize,
    records: Mutex<VecDeque<serde_json::Value>>,
    dropped: AtomicU64,
}

impl TelemetryQueue {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        TelemetryQueue {
            name,
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues `record`, dropping the oldest entry on overflow. Never
    /// blocks.
    pub fn push(&self, record: serde_json::Value) {
        let mut records = self.records.lock().unwrap();
        if records.len() >= self.capacity {
            records.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("queue_dropped_total", "queue" => self.name).increment(1);
        }
        records.push_back(record);
        metrics::gauge!("queue_depth", "queue" => self.name).set(records.len() as f64);
    }

    /// Pops up to `max_batch` records, FIFO.
    pub fn drain(&self, max_batch: usize) -> Vec<serde_json::Value> {
        let mut records = self.records.lock().unwrap();
        let n = max_batch.min(records.len());
        let batch: Vec<_> = records.drain(..n).collect();
        metrics::gauge!("queue_depth", "queue" => self.name).set(records.len() as f64);
        batch
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_on_overflow() {
        let queue = TelemetryQueue::new("test", 2);
        queue.push(serde_json::json!(1));
        queue.push(serde_json::json!(2));
        queue.push(serde_json::json!(3));

        assert_eq!(queue.dropped_total(), 1);
        let drained = queue.drain(10);
        assert_eq!(drained, vec![serde_json::json!(2), serde_json::json!(3)]);
    }

    #[test]
    fn drain_respects_max_batch() {
        let queue = TelemetryQueue::new("test", 10);
        for i in 0..5 {
            queue.push(serde_json::json!(i));
        }
        let batch = queue.drain(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(queue.len(), 2);
    }
}
