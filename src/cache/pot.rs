#![forbid(unsafe_code)]

//! Single-slot Proof-of-Origin token cache.
//!
//! The external resolver consumes one opaque token; there is no per-client
//! identity, so one slot is the whole cache.

use std::time::{Duration, Instant};

use parking_lot::RwLock;

pub const POT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

struct Slot {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct PotCache {
    slot: RwLock<Option<Slot>>,
}

impl PotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        let slot = self.slot.read();
        slot.as_ref()
            .filter(|slot| Instant::now() <= slot.expires_at)
            .map(|slot| slot.token.clone())
    }

    pub fn set(&self, token: impl Into<String>, ttl: Duration) {
        *self.slot.write() = Some(Slot {
            token: token.into(),
            expires_at: Instant::now() + ttl,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_misses() {
        assert_eq!(PotCache::new().get(), None);
    }

    #[test]
    fn token_survives_within_ttl() {
        let cache = PotCache::new();
        cache.set("tok-1", POT_TOKEN_TTL);
        assert_eq!(cache.get().as_deref(), Some("tok-1"));
    }

    #[test]
    fn set_replaces_previous_token() {
        let cache = PotCache::new();
        cache.set("tok-1", POT_TOKEN_TTL);
        cache.set("tok-2", POT_TOKEN_TTL);
        assert_eq!(cache.get().as_deref(), Some("tok-2"));
    }

    #[test]
    fn expired_token_misses() {
        let cache = PotCache::new();
        cache.set("tok-1", Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get(), None);
    }
}
