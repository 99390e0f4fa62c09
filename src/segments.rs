//! Component B: the segment membership store.
//!
//! Tracks, per segment, its member set and a bounded change log, plus an
//! inverted key -> segment-names index so `segments_for(key)` never scans
//! every segment.

use crate::error::SegmentStoreError;
use crate::splits::{DEFAULT_RETENTION_AGE, DEFAULT_RETENTION_ENTRIES};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

#[derive(Debug, Clone)]
struct SegmentMutationEntry {
    change_number: i64,
    added: HashSet<String>,
    removed: HashSet<String>,
    recorded_at: std::time::Instant,
}

struct SegmentState {
    members: HashSet<String>,
    change_number: i64,
    log: VecDeque<SegmentMutationEntry>,
    removed_total: u64,
    /// The `changeNumber` of the most recently evicted mutation, or `-1` if
    /// nothing has ever been evicted.
    floor: i64,
}

impl SegmentState {
    fn new() -> Self {
        SegmentState {
            members: HashSet::new(),
            change_number: -1,
            log: VecDeque::new(),
            removed_total: 0,
            floor: -1,
        }
    }
}

/// The wire-compatible response shape for `/segmentChanges/:name`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SegmentChanges {
    pub name: String,
    pub since: i64,
    pub till: i64,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

struct Inner {
    segments: HashMap<String, SegmentState>,
    /// Inverted index: key -> set of segment names currently containing it.
    membership: HashMap<String, HashSet<String>>,
}

pub struct SegmentStore {
    inner: RwLock<Inner>,
    retention_entries: usize,
    retention_age: Duration,
}

impl Default for SegmentStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_ENTRIES, DEFAULT_RETENTION_AGE)
    }
}

impl SegmentStore {
    pub fn new(retention_entries: usize, retention_age: Duration) -> Self {
        SegmentStore {
            inner: RwLock::new(Inner {
                segments: HashMap::new(),
                membership: HashMap::new(),
            }),
            retention_entries,
            retention_age,
        }
    }

    /// Atomically applies an add/remove delta to a segment, advancing its
    /// change-number and keeping the inverted index consistent. A
    /// `changeNumber` not strictly greater than the segment's current one
    /// is ignored (§7 StorageConsistency).
    pub fn update(
        &self,
        segment_name: &str,
        added: HashSet<String>,
        removed: HashSet<String>,
        new_change_number: i64,
    ) {
        let mut inner = self.inner.write().unwrap();

        let state = inner
            .segments
            .entry(segment_name.to_string())
            .or_insert_with(SegmentState::new);

        if new_change_number <= state.change_number {
            return;
        }

        for key in &added {
            state.members.insert(key.clone());
        }
        for key in &removed {
            if state.members.remove(key) {
                state.removed_total += 1;
            }
        }
        state.change_number = new_change_number;
        state.log.push_back(SegmentMutationEntry {
            change_number: new_change_number,
            added: added.clone(),
            removed: removed.clone(),
            recorded_at: std::time::Instant::now(),
        });

        while state.log.len() > self.retention_entries {
            if let Some(front) = state.log.front() {
                if front.recorded_at.elapsed() <= self.retention_age {
                    break;
                }
            }
            if let Some(evicted) = state.log.pop_front() {
                state.floor = state.floor.max(evicted.change_number);
            }
        }

        for key in &added {
            inner
                .membership
                .entry(key.clone())
                .or_default()
                .insert(segment_name.to_string());
        }
        for key in &removed {
            if let Some(segments) = inner.membership.get_mut(key) {
                segments.remove(segment_name);
                if segments.is_empty() {
                    inner.membership.remove(key);
                }
            }
        }
    }

    /// Replays mutations of `segment_name` with `changeNumber > s`. If `s`
    /// predates the segment's retention window, the full current membership
    /// is returned as `added` with `since = -1`.
    pub fn changes_since(
        &self,
        segment_name: &str,
        s: i64,
    ) -> Result<SegmentChanges, SegmentStoreError> {
        let inner = self.inner.read().unwrap();
        let state = inner
            .segments
            .get(segment_name)
            .ok_or_else(|| SegmentStoreError::NotFound(segment_name.to_string()))?;

        if s < state.floor {
            let mut added: Vec<String> = state.members.iter().cloned().collect();
            added.sort();
            return Ok(SegmentChanges {
                name: segment_name.to_string(),
                since: -1,
                till: state.change_number,
                added,
                removed: Vec::new(),
            });
        }

        let mut added = HashSet::new();
        let mut removed = HashSet::new();
        for entry in state.log.iter().filter(|e| e.change_number > s) {
            for key in &entry.added {
                removed.remove(key);
                added.insert(key.clone());
            }
            for key in &entry.removed {
                added.remove(key);
                removed.insert(key.clone());
            }
        }

        let mut added: Vec<String> = added.into_iter().collect();
        let mut removed: Vec<String> = removed.into_iter().collect();
        added.sort();
        removed.sort();

        Ok(SegmentChanges {
            name: segment_name.to_string(),
            since: s,
            till: state.change_number,
            added,
            removed,
        })
    }

    /// All segment names currently containing `key`, in O(result size).
    pub fn segments_for(&self, key: &str) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .membership
            .get(key)
            .map(|segments| segments.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count_active(&self, segment_name: &str) -> Option<u64> {
        self.inner
            .read()
            .unwrap()
            .segments
            .get(segment_name)
            .map(|s| s.members.len() as u64)
    }

    pub fn count_removed(&self, segment_name: &str) -> Option<u64> {
        self.inner
            .read()
            .unwrap()
            .segments
            .get(segment_name)
            .map(|s| s.removed_total)
    }

    pub fn change_number(&self, segment_name: &str) -> Option<i64> {
        self.inner
            .read()
            .unwrap()
            .segments
            .get(segment_name)
            .map(|s| s.change_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn inverted_index_reflects_membership() {
        // S3 from the design doc.
        let store = SegmentStore::default();
        store.update("vip", set(&["alice", "bob"]), HashSet::new(), 1);
        store.update("beta", set(&["bob", "carol"]), HashSet::new(), 1);

        let mut bobs_segments = store.segments_for("bob");
        bobs_segments.sort();
        assert_eq!(bobs_segments, vec!["beta".to_string(), "vip".to_string()]);
        assert_eq!(store.segments_for("alice"), vec!["vip".to_string()]);
    }

    #[test]
    fn unknown_segment_not_found() {
        let store = SegmentStore::default();
        assert_eq!(
            store.changes_since("nope", 0),
            Err(SegmentStoreError::NotFound("nope".to_string()))
        );
    }

    #[test]
    fn removal_updates_inverted_index() {
        let store = SegmentStore::default();
        store.update("vip", set(&["alice"]), HashSet::new(), 1);
        assert_eq!(store.segments_for("alice"), vec!["vip".to_string()]);

        store.update("vip", HashSet::new(), set(&["alice"]), 2);
        assert!(store.segments_for("alice").is_empty());
        assert_eq!(store.count_removed("vip"), Some(1));
    }

    #[test]
    fn changes_since_replays_deltas() {
        let store = SegmentStore::default();
        store.update("vip", set(&["alice"]), HashSet::new(), 1);
        store.update("vip", set(&["bob"]), set(&["alice"]), 2);

        let changes = store.changes_since("vip", 1).unwrap();
        assert_eq!(changes.added, vec!["bob".to_string()]);
        assert_eq!(changes.removed, vec!["alice".to_string()]);
        assert_eq!(changes.till, 2);
    }

    #[test]
    fn retention_miss_returns_full_snapshot() {
        let store = SegmentStore::new(2, Duration::from_millis(0));
        store.update("vip", set(&["a"]), HashSet::new(), 1);
        store.update("vip", set(&["b"]), HashSet::new(), 2);
        store.update("vip", set(&["c"]), HashSet::new(), 3);
        store.update("vip", set(&["d"]), HashSet::new(), 4);

        let changes = store.changes_since("vip", 0).unwrap();
        assert_eq!(changes.since, -1);
        let mut added = changes.added.clone();
        added.sort();
        assert_eq!(
            added,
            vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()]
        );
    }
}
