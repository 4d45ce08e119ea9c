//! Processed-activity fingerprint set (§4.5 step 4: "dedupe check"; §3 "Processed-activity
//! fingerprint"). Grounded on [`crate::core::key_cache::KeyCache`]'s `moka` usage, here keyed by
//! activity id rather than key id, with a shorter TTL and a hard capacity cap (§4.5: "TTL 1hr,
//! cap 10000").

use moka::future::Cache;
use std::time::Duration;

/// Default entry lifetime (§4.5: "TTL 1hr").
pub const DEDUPE_TTL: Duration = Duration::from_secs(60 * 60);
/// Default entry cap (§4.5: "cap 10000"), oldest entries evicted first once exceeded.
pub const DEDUPE_CAPACITY: u64 = 10_000;

/// Bounded, TTL-evicting set of activity ids already dispatched to an inbox handler.
#[derive(Clone)]
pub struct DedupeSet {
    seen: Cache<String, ()>,
}

impl DedupeSet {
    pub fn new() -> Self {
        DedupeSet {
            seen: Cache::builder()
                .max_capacity(DEDUPE_CAPACITY)
                .time_to_live(DEDUPE_TTL)
                .build(),
        }
    }

    /// Returns `true` if `activity_id` was already seen (and is now, in either case, marked
    /// seen). Mirrors §4.5's "insert and trim" step: checking and recording are one atomic-ish
    /// operation from the caller's perspective.
    pub async fn check_and_insert(&self, activity_id: &str) -> bool {
        if self.seen.get(activity_id).await.is_some() {
            return true;
        }
        self.seen.insert(activity_id.to_string(), ()).await;
        false
    }
}

impl Default for DedupeSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_check_is_not_a_duplicate() {
        let set = DedupeSet::new();
        assert!(!set.check_and_insert("https://fed.example/activities/create-1").await);
    }

    #[tokio::test]
    async fn repeated_check_is_a_duplicate() {
        let set = DedupeSet::new();
        assert!(!set.check_and_insert("https://fed.example/activities/create-1").await);
        assert!(set.check_and_insert("https://fed.example/activities/create-1").await);
    }

    #[tokio::test]
    async fn distinct_ids_do_not_collide() {
        let set = DedupeSet::new();
        assert!(!set.check_and_insert("a").await);
        assert!(!set.check_and_insert("b").await);
    }
}
