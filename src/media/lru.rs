//! In-memory, byte-capped LRU used to avoid re-fetching recently served media (§4.3).
//!
//! A plain `Mutex`-guarded structure, not `moka`: entries must be evicted by total byte budget
//! rather than entry count or TTL. `moka`'s weighted-capacity mode supports that, but a
//! hand-rolled insertion-order eviction is simpler to audit for the one policy §4.3 asks for
//! ("eviction is insertion-order until under cap").

use std::{
    collections::VecDeque,
    sync::Mutex,
};

struct Entry {
    key: String,
    bytes: Vec<u8>,
}

struct Inner {
    entries: VecDeque<Entry>,
    total_bytes: usize,
}

/// Byte-capped cache of recently fetched media bodies, keyed by `handle:<URL>` (§4.3).
pub struct MediaLruCache {
    capacity_bytes: usize,
    inner: Mutex<Inner>,
}

impl MediaLruCache {
    pub fn new(capacity_bytes: usize) -> Self {
        MediaLruCache {
            capacity_bytes,
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                total_bytes: 0,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.iter().find(|e| e.key == key).map(|e| e.bytes.clone())
    }

    /// Inserts `bytes` under `key`, evicting the oldest entries (insertion order) until the
    /// cache is back under `capacity_bytes`.
    pub fn insert(&self, key: String, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.entries.iter().any(|e| e.key == key) {
            return;
        }
        inner.total_bytes += bytes.len();
        inner.entries.push_back(Entry { key, bytes });
        while inner.total_bytes > self.capacity_bytes {
            match inner.entries.pop_front() {
                Some(evicted) => inner.total_bytes -= evicted.bytes.len(),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_once_over_capacity() {
        let cache = MediaLruCache::new(10);
        cache.insert("a".to_string(), vec![0; 6]);
        cache.insert("b".to_string(), vec![0; 6]);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn get_returns_none_for_missing_key() {
        let cache = MediaLruCache::new(10);
        assert!(cache.get("missing").is_none());
    }
}
