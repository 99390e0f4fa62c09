//! Component A: the split history store.
//!
//! Keeps a materialized `name -> Split` view alongside a bounded,
//! `changeNumber`-ordered mutation log, so `/splitChanges?since=S` can be
//! answered from memory without an upstream round-trip.

use crate::error::SplitStoreError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

/// Default retention window: one hour of mutations or 1,000 entries,
/// whichever is larger.
pub const DEFAULT_RETENTION_ENTRIES: usize = 1_000;
pub const DEFAULT_RETENTION_AGE: Duration = Duration::from_secs(60 * 60);

/// A single committed mutation to a split's definition.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitMutation {
    pub change_number: i64,
    pub name: String,
    pub previous_change_number: Option<i64>,
    /// `None` marks a tombstone (the split was archived/deleted).
    pub payload: Option<serde_json::Value>,
    pub recorded_at: std::time::Instant,
}

/// The wire-compatible response shape for `/splitChanges`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SplitChanges {
    pub since: i64,
    pub till: i64,
    pub splits: Vec<serde_json::Value>,
}

struct Inner {
    current: HashMap<String, serde_json::Value>,
    log: VecDeque<SplitMutation>,
    current_change_number: i64,
    /// The `changeNumber` of the most recently evicted mutation, or `-1` if
    /// nothing has ever been evicted. A `since` at or below this value can
    /// no longer be answered from the log.
    floor: i64,
}

/// Ordered, historical store of split mutations with a retained change log.
pub struct SplitStore {
    inner: RwLock<Inner>,
    retention_entries: usize,
    retention_age: Duration,
}

impl Default for SplitStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_ENTRIES, DEFAULT_RETENTION_AGE)
    }
}

impl SplitStore {
    pub fn new(retention_entries: usize, retention_age: Duration) -> Self {
        SplitStore {
            inner: RwLock::new(Inner {
                current: HashMap::new(),
                log: VecDeque::new(),
                current_change_number: -1,
                floor: -1,
            }),
            retention_entries,
            retention_age,
        }
    }

    /// Applies an ordered batch of mutations. Mutations whose `changeNumber`
    /// is not strictly greater than the store's current maximum are
    /// silently dropped (§7 StorageConsistency). The whole batch is applied
    /// under a single write lock, so readers never observe a torn update.
    pub fn update(&self, mutations: impl IntoIterator<Item = SplitMutation>) {
        let mut inner = self.inner.write().unwrap();

        for mutation in mutations {
            if mutation.change_number <= inner.current_change_number {
                continue;
            }

            match &mutation.payload {
                Some(payload) => {
                    inner.current.insert(mutation.name.clone(), payload.clone());
                }
                None => {
                    inner.current.remove(&mutation.name);
                }
            }

            inner.current_change_number = mutation.change_number;
            inner.log.push_back(mutation);
        }

        Self::evict(&mut inner, self.retention_entries, self.retention_age);
    }

    fn evict(inner: &mut Inner, retention_entries: usize, retention_age: Duration) {
        while inner.log.len() > retention_entries {
            if let Some(front) = inner.log.front() {
                if front.recorded_at.elapsed() <= retention_age {
                    // Within the last hour, and over the entry cap: keep it,
                    // since retention is "last hour OR 1,000 entries,
                    // whichever is larger".
                    break;
                }
            }
            if let Some(evicted) = inner.log.pop_front() {
                inner.floor = inner.floor.max(evicted.change_number);
            }
        }
    }

    /// Returns every mutation with `changeNumber > s`, coalesced so each
    /// split name appears at most once (latest mutation wins), in ascending
    /// order. Fails with `NotCached` if `s` predates the retention window.
    pub fn changes_since(&self, s: i64) -> Result<SplitChanges, SplitStoreError> {
        let inner = self.inner.read().unwrap();

        if s < inner.floor {
            return Err(SplitStoreError::NotCached);
        }

        let mut latest: HashMap<&str, &SplitMutation> = HashMap::new();
        for mutation in inner.log.iter().filter(|m| m.change_number > s) {
            latest.insert(&mutation.name, mutation);
        }

        let mut splits: Vec<&SplitMutation> = latest.into_values().collect();
        splits.sort_by_key(|m| m.change_number);

        Ok(SplitChanges {
            since: s,
            till: inner.current_change_number,
            splits: splits
                .into_iter()
                .map(|m| {
                    m.payload.clone().unwrap_or_else(|| {
                        serde_json::json!({"name": m.name, "status": "ARCHIVED"})
                    })
                })
                .collect(),
        })
    }

    pub fn current_change_number(&self) -> i64 {
        self.inner.read().unwrap().current_change_number
    }

    /// The union of segment names referenced by any live split's targeting
    /// rules, derived from the opaque payload's `conditions[*].matcherGroup
    /// .matchers[*].userDefinedSegmentMatcherData.segmentName` field.
    pub fn names_of_registered_segments(&self) -> HashSet<String> {
        let inner = self.inner.read().unwrap();
        let mut names = HashSet::new();

        for payload in inner.current.values() {
            collect_segment_names(payload, &mut names);
        }

        names
    }
}

fn collect_segment_names(payload: &serde_json::Value, out: &mut HashSet<String>) {
    let Some(conditions) = payload.get("conditions").and_then(|c| c.as_array()) else {
        return;
    };
    for condition in conditions {
        let Some(matchers) = condition
            .get("matcherGroup")
            .and_then(|g| g.get("matchers"))
            .and_then(|m| m.as_array())
        else {
            continue;
        };
        for matcher in matchers {
            if let Some(name) = matcher
                .get("userDefinedSegmentMatcherData")
                .and_then(|d| d.get("segmentName"))
                .and_then(|n| n.as_str())
            {
                out.insert(name.to_string());
            }
        }
    }
}
