//! Component C: the surrogate-tagged HTTP response cache.
//!
//! Sits in front of the SDK controller (component F). Identical requests
//! share one cached body; a mutation commits a targeted purge by surrogate
//! tag rather than a full flush.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// Builds a fingerprint from method, path, and a pre-sorted query
    /// string; callers are responsible for sorting query parameters before
    /// calling this so that `?a=1&b=2` and `?b=2&a=1` collide.
    pub fn new(method: &str, path: &str, sorted_query: &str) -> Self {
        RequestFingerprint(format!("{method} {path}?{sorted_query}"))
    }
}

struct CacheEntry {
    body: bytes::Bytes,
    tags: Vec<String>,
    inserted_at: Instant,
    sequence: u64,
}

struct Inner {
    entries: HashMap<RequestFingerprint, CacheEntry>,
    next_sequence: u64,
}

/// An HTTP response cache keyed by request fingerprint, tagged with
/// surrogate keys for targeted invalidation.
pub struct SurrogateCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for SurrogateCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl SurrogateCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        SurrogateCache {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_sequence: 0,
            }),
            ttl,
            max_entries,
        }
    }

    /// Returns the cached body for `fingerprint`, if present and not past
    /// its absolute TTL.
    pub fn get(&self, fingerprint: &RequestFingerprint) -> Option<bytes::Bytes> {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get(fingerprint) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.body.clone()),
            Some(_) => {
                inner.entries.remove(fingerprint);
                None
            }
            None => None,
        }
    }

    /// Inserts a cacheable response. Callers are responsible for checking
    /// cacheability (GET, 2xx, sticky) before calling this.
    pub fn insert(&self, fingerprint: RequestFingerprint, body: bytes::Bytes, tags: Vec<String>) {
        let mut inner = self.inner.lock().unwrap();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        inner.entries.insert(
            fingerprint,
            CacheEntry {
                body,
                tags,
                inserted_at: Instant::now(),
                sequence,
            },
        );

        Self::evict_lru(&mut inner, self.max_entries);
    }

    fn evict_lru(inner: &mut Inner, max_entries: usize) {
        while inner.entries.len() > max_entries {
            if let Some(key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.sequence)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&key);
            } else {
                break;
            }
        }
    }

    /// Removes every cache entry whose tags contain `tag`.
    pub fn purge_by_tag(&self, tag: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entries
            .retain(|_, entry| !entry.tags.iter().any(|t| t == tag));
    }

    /// Removes every cache entry with a tag starting with `prefix`, for
    /// invalidating a whole tag family at once (e.g. every `mySeg/<hash>`
    /// entry on a segment membership change).
    pub fn purge_by_prefix(&self, prefix: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entries
            .retain(|_, entry| !entry.tags.iter().any(|t| t.starts_with(prefix)));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Surrogate tag helpers (§3 SurrogateTag).
pub mod tags {
    pub const SPLITS: &str = "splits";
    pub const MY_SEGMENTS_PREFIX: &str = "mySeg/";

    pub fn segment(name: &str) -> String {
        format!("seg/{name}")
    }

    /// A short, stable (not necessarily cryptographic) hash of a raw SDK
    /// key, used so `mySeg/<hash>` tags don't leak raw keys into metrics or
    /// logs.
    pub fn my_segments(key: &str) -> String {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        format!("{MY_SEGMENTS_PREFIX}{:x}", hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_then_purge() {
        // S4 from the design doc.
        let cache = SurrogateCache::default();
        let fp = RequestFingerprint::new("GET", "/splitChanges", "since=-1");

        assert!(cache.get(&fp).is_none());
        cache.insert(
            fp.clone(),
            bytes::Bytes::from(b"body".to_vec()),
            vec![tags::SPLITS.to_string()],
        );

        let hit = cache.get(&fp).unwrap();
        assert_eq!(&*hit, b"body");

        cache.purge_by_tag(tags::SPLITS);
        assert!(cache.get(&fp).is_none());
    }

    #[test]
    fn unrelated_tags_survive_purge() {
        let cache = SurrogateCache::default();
        let fp_a = RequestFingerprint::new("GET", "/segmentChanges/vip", "since=-1");
        let fp_b = RequestFingerprint::new("GET", "/segmentChanges/beta", "since=-1");

        cache.insert(
            fp_a.clone(),
            bytes::Bytes::from(b"a".to_vec()),
            vec![tags::segment("vip")],
        );
        cache.insert(
            fp_b.clone(),
            bytes::Bytes::from(b"b".to_vec()),
            vec![tags::segment("beta")],
        );

        cache.purge_by_tag(&tags::segment("vip"));
        assert!(cache.get(&fp_a).is_none());
        assert!(cache.get(&fp_b).is_some());
    }

    #[test]
    fn purge_by_prefix_removes_whole_tag_family() {
        let cache = SurrogateCache::default();
        let fp_a = RequestFingerprint::new("GET", "/mySegments/alice", "");
        let fp_b = RequestFingerprint::new("GET", "/mySegments/bob", "");
        let fp_c = RequestFingerprint::new("GET", "/splitChanges", "since=-1");

        cache.insert(fp_a.clone(), bytes::Bytes::from(b"a".to_vec()), vec![tags::my_segments("alice")]);
        cache.insert(fp_b.clone(), bytes::Bytes::from(b"b".to_vec()), vec![tags::my_segments("bob")]);
        cache.insert(fp_c.clone(), bytes::Bytes::from(b"c".to_vec()), vec![tags::SPLITS.to_string()]);

        cache.purge_by_prefix("mySeg/");
        assert!(cache.get(&fp_a).is_none());
        assert!(cache.get(&fp_b).is_none());
        assert!(cache.get(&fp_c).is_some());
    }

    #[test]
    fn lru_evicts_oldest_when_full() {
        let cache = SurrogateCache::new(DEFAULT_TTL, 2);
        for i in 0..3 {
            cache.insert(
                RequestFingerprint::new("GET", "/splitChanges", &format!("since={i}")),
                bytes::Bytes::from(vec![i as u8]),
                vec![],
            );
        }
        assert_eq!(cache.len(), 2);
        assert!(cache
            .get(&RequestFingerprint::new("GET", "/splitChanges", "since=0"))
            .is_none());
    }

    #[test]
    fn ttl_expires_entries() {
        let cache = SurrogateCache::new(Duration::from_millis(1), DEFAULT_MAX_ENTRIES);
        let fp = RequestFingerprint::new("GET", "/splitChanges", "since=-1");
        cache.insert(fp.clone(), bytes::Bytes::from(vec![1]), vec![]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&fp).is_none());
    }
}
