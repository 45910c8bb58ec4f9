#![forbid(unsafe_code)]

//! Size-bounded LRU cache for fully streamed response bodies.
//!
//! Keys are the resolved-URL cache keys, values are whole video bodies.
//! A single mutex guards both the LRU order and the running size total:
//! `get` promotes the entry, so a reader lock would not be enough.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

/// Per-entry ceiling. Bodies larger than this are streamed to the client but
/// never cached, independent of the total budget.
pub const MAX_ENTRY_BYTES: usize = 10 * 1024 * 1024;

struct ByteEntry {
    data: Bytes,
    expires_at: Instant,
}

struct Inner {
    entries: LruCache<String, ByteEntry>,
    total_bytes: usize,
}

pub struct ByteCache {
    inner: Mutex<Inner>,
    max_bytes: usize,
}

impl ByteCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                // Bounded by bytes, not entry count.
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Returns the body and marks the key most-recently-used. An expired
    /// entry is evicted under the same lock and reads as a miss.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            None => return None,
            Some(entry) if Instant::now() <= entry.expires_at => {
                return Some(entry.data.clone());
            }
            Some(_) => {}
        }
        if let Some(entry) = inner.entries.pop(key) {
            inner.total_bytes -= entry.data.len();
            debug!(key, size = entry.data.len(), "evicted expired body");
        }
        None
    }

    /// Unexpired presence check without touching LRU order.
    pub fn contains(&self, key: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .entries
            .peek(key)
            .is_some_and(|entry| Instant::now() <= entry.expires_at)
    }

    /// Inserts the body, evicting least-recently-used entries until it fits.
    /// A body over the per-entry ceiling or the whole budget is silently
    /// dropped; an insert that fits never fails.
    pub fn insert(&self, key: impl Into<String>, data: Bytes, ttl: Duration) {
        if data.len() > MAX_ENTRY_BYTES || data.len() > self.max_bytes {
            return;
        }

        let key = key.into();
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.entries.pop(&key) {
            inner.total_bytes -= previous.data.len();
        }
        while inner.total_bytes + data.len() > self.max_bytes {
            let Some((evicted_key, evicted)) = inner.entries.pop_lru() else {
                break;
            };
            inner.total_bytes -= evicted.data.len();
            debug!(
                key = %evicted_key,
                size = evicted.data.len(),
                "evicted body for space"
            );
        }

        inner.total_bytes += data.len();
        inner.entries.put(
            key,
            ByteEntry {
                data,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drops expired bodies; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| now > entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = inner.entries.pop(key) {
                inner.total_bytes -= entry.data.len();
                debug!(key = %key, size = entry.data.len(), "evicted expired body");
            }
        }
        expired.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.sweep();
                if removed > 0 {
                    debug!(cache = "bytes", removed, "swept expired bodies");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: usize = 1024;
    const TTL: Duration = Duration::from_secs(60);

    fn body(len: usize) -> Bytes {
        Bytes::from(vec![0u8; len])
    }

    #[test]
    fn get_returns_inserted_body() {
        let cache = ByteCache::new(MAX_ENTRY_BYTES);
        cache.insert("a", Bytes::from_static(b"hello"), TTL);
        assert_eq!(cache.get("a").as_deref(), Some(&b"hello"[..]));
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
    }

    #[test]
    fn oversized_body_is_dropped() {
        let cache = ByteCache::new(KIB);
        cache.insert("big", body(KIB + 1), TTL);
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn per_entry_ceiling_applies_even_under_a_large_budget() {
        let cache = ByteCache::new(100 * 1024 * KIB);
        cache.insert("big", body(MAX_ENTRY_BYTES + 1), TTL);
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);

        cache.insert("fits", body(MAX_ENTRY_BYTES), TTL);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), MAX_ENTRY_BYTES);
    }

    #[test]
    fn total_size_never_exceeds_budget() {
        let cache = ByteCache::new(1024 * KIB);
        for i in 0..10 {
            cache.insert(format!("k{i}"), body(400 * KIB), TTL);
            assert!(cache.total_bytes() <= 1024 * KIB);
        }
    }

    #[test]
    fn replacing_a_key_retires_its_old_size() {
        let cache = ByteCache::new(1024 * KIB);
        cache.insert("k", body(400 * KIB), TTL);
        cache.insert("k", body(100 * KIB), TTL);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 100 * KIB);
    }

    #[test]
    fn get_refreshes_lru_position() {
        // A, B, C fill a 1 MiB cache; touching A makes B the eviction victim
        // when D arrives.
        let cache = ByteCache::new(1024 * KIB);
        cache.insert("a", body(300 * KIB), TTL);
        cache.insert("b", body(300 * KIB), TTL);
        cache.insert("c", body(300 * KIB), TTL);
        assert!(cache.get("a").is_some());

        cache.insert("d", body(300 * KIB), TTL);

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
        assert!(cache.total_bytes() <= 1024 * KIB);
    }

    #[test]
    fn expired_body_is_evicted_on_get() {
        let cache = ByteCache::new(1024 * KIB);
        cache.insert("a", body(KIB), Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn sweep_reclaims_expired_bodies() {
        let cache = ByteCache::new(1024 * KIB);
        cache.insert("stale", body(KIB), Duration::from_millis(5));
        cache.insert("fresh", body(KIB), TTL);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), KIB);
    }
}
