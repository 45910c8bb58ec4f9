#![forbid(unsafe_code)]

//! Generic string-keyed cache with per-entry expiry.
//!
//! Backs both the search-response cache and the resolved-URL cache. Expiry is
//! evaluated on every `get`; the background sweeper only reclaims memory for
//! entries nobody asks about anymore.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the value if present and unexpired. Expired entries read as
    /// absent but are left for the sweeper; `get` only needs the read lock.
    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if Instant::now() > entry.expires_at {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Inserts or replaces; replacement is atomic under the write lock.
    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let mut entries = self.entries.write();
        entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drops every expired entry; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now <= entry.expires_at);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    /// Spawns the periodic sweep task. Best-effort garbage collection; `get`
    /// already treats expired entries as absent.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, label: &'static str) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.sweep();
                if removed > 0 {
                    debug!(cache = label, removed, "swept expired entries");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_inserted_value_within_ttl() {
        let cache = TtlCache::new();
        cache.insert("k", 42u32, Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some(42));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let cache = TtlCache::new();
        cache.insert("k", 1u32, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn insert_overwrites_existing_entry() {
        let cache = TtlCache::new();
        cache.insert("k", "old".to_string(), Duration::from_secs(60));
        cache.insert("k", "new".to_string(), Duration::from_secs(60));
        assert_eq!(cache.get("k").as_deref(), Some("new"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let cache = TtlCache::new();
        cache.insert("stale", 1u32, Duration::from_millis(5));
        cache.insert("fresh", 2u32, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("fresh"), Some(2));
    }
}
