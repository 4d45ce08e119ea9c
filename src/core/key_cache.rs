//! Public-key cache: key id → PEM, TTL-bounded, size-capped, evicted on verification failure
//! (§3 "Public-key cache entry", §4.2, §5 "shared read-mostly; writers take a mutex").
//!
//! Built on `moka::future::Cache`, used elsewhere in this crate for bounded, concurrent,
//! TTL-evicting maps.

use moka::future::Cache;
use std::time::Duration;

/// Default TTL for a cached public key (§4.2: "cache first; TTL 1 hour").
pub const KEY_TTL: Duration = Duration::from_secs(60 * 60);

/// Read-mostly cache of signer public keys, keyed by `keyId`.
#[derive(Clone)]
pub struct KeyCache {
    cache: Cache<String, String>,
}

impl KeyCache {
    /// Builds a cache capped at `capacity` entries with [`KEY_TTL`] expiry.
    pub fn new(capacity: u64) -> Self {
        KeyCache {
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(KEY_TTL)
                .build(),
        }
    }

    /// Returns the cached PEM for `key_id`, if present and unexpired.
    pub async fn get(&self, key_id: &str) -> Option<String> {
        self.cache.get(key_id).await
    }

    /// Inserts or refreshes the cached PEM for `key_id`.
    pub async fn insert(&self, key_id: String, pem: String) {
        self.cache.insert(key_id, pem).await;
    }

    /// Evicts `key_id`. Called after a verification failure so a stale or rotated key is
    /// refetched on the next attempt, per §4.2 ("On verification failure, evict the cached key
    /// and do NOT retry").
    pub async fn evict(&self, key_id: &str) {
        self.cache.invalidate(key_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_get_then_evict() {
        let cache = KeyCache::new(10);
        cache.insert("https://a/actor#main-key".to_string(), "PEM".to_string()).await;
        assert_eq!(
            cache.get("https://a/actor#main-key").await,
            Some("PEM".to_string())
        );
        cache.evict("https://a/actor#main-key").await;
        assert_eq!(cache.get("https://a/actor#main-key").await, None);
    }
}
