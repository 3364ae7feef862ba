//! # Snapshot Cache
//!
//! Holds the most recent successful snapshot of each host.
//!
//! Two read paths exist. [`SnapshotCache::get`] honours the freshness window
//! and is what the scheduler consults before spending an upstream request.
//! [`SnapshotCache::last_known`] ignores it and is what a new subscriber is
//! shown while the next poll is in flight.
//!
//! Writes are monotonic: a snapshot whose `fetched_at_millis` is not newer
//! than the cached one is refused, so a slow fetch that completes late can
//! never roll a host back in time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::core::model::ResourceSnapshot;

/// Result of [`SnapshotCache::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The snapshot replaced the cached entry (or was the first one).
    Stored,
    /// A newer or equally old snapshot was already cached.
    Rejected {
        /// Timestamp of the snapshot kept in the cache.
        cached_at_millis: u64,
        /// Timestamp of the snapshot that was refused.
        offered_at_millis: u64,
    },
}

struct CacheEntry {
    snapshot: Arc<ResourceSnapshot>,
    stored_at: Instant,
}

/// # Snapshot Cache
///
/// Keyed by host id. Entries are replaced, never merged.
pub struct SnapshotCache {
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
}

impl SnapshotCache {
    /// A cache whose entries stay fresh for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// The cached snapshot if it was stored less than `ttl` ago.
    pub fn get(&self, host_id: &str) -> Option<Arc<ResourceSnapshot>> {
        self.entries
            .get(host_id)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| Arc::clone(&entry.snapshot))
    }

    /// The cached snapshot regardless of age.
    pub fn last_known(&self, host_id: &str) -> Option<Arc<ResourceSnapshot>> {
        self.entries.get(host_id).map(|entry| Arc::clone(&entry.snapshot))
    }

    /// Stores `snapshot` under its own host id unless an entry at least as
    /// new is already present.
    pub fn put(&mut self, snapshot: Arc<ResourceSnapshot>) -> PutOutcome {
        if let Some(existing) = self.entries.get(&snapshot.host_id) {
            if existing.snapshot.fetched_at_millis >= snapshot.fetched_at_millis {
                return PutOutcome::Rejected {
                    cached_at_millis: existing.snapshot.fetched_at_millis,
                    offered_at_millis: snapshot.fetched_at_millis,
                };
            }
        }
        self.entries.insert(
            snapshot.host_id.clone(),
            CacheEntry {
                snapshot,
                stored_at: Instant::now(),
            },
        );
        PutOutcome::Stored
    }

    /// Drops the entry for `host_id`. Returns `true` if one existed.
    pub fn invalidate(&mut self, host_id: &str) -> bool {
        self.entries.remove(host_id).is_some()
    }

    /// Number of cached hosts.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(host: &str, at: u64) -> Arc<ResourceSnapshot> {
        Arc::new(ResourceSnapshot {
            host_id: host.into(),
            fetched_at_millis: at,
            records: Vec::new(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_honours_ttl_but_last_known_does_not() {
        let mut cache = SnapshotCache::new(Duration::from_secs(5));
        assert_eq!(cache.put(snapshot("h1", 10)), PutOutcome::Stored);
        assert!(cache.get("h1").is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get("h1").is_none());
        assert_eq!(cache.last_known("h1").unwrap().fetched_at_millis, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_is_monotonic() {
        let mut cache = SnapshotCache::new(Duration::from_secs(5));
        cache.put(snapshot("h1", 20));

        assert_eq!(
            cache.put(snapshot("h1", 20)),
            PutOutcome::Rejected { cached_at_millis: 20, offered_at_millis: 20 }
        );
        assert!(matches!(cache.put(snapshot("h1", 15)), PutOutcome::Rejected { .. }));
        assert_eq!(cache.last_known("h1").unwrap().fetched_at_millis, 20);

        assert_eq!(cache.put(snapshot("h1", 21)), PutOutcome::Stored);
        assert_eq!(cache.get("h1").unwrap().fetched_at_millis, 21);

        // Other hosts are independent.
        assert_eq!(cache.put(snapshot("h2", 1)), PutOutcome::Stored);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate() {
        let mut cache = SnapshotCache::new(Duration::from_secs(5));
        cache.put(snapshot("h1", 1));
        assert!(cache.invalidate("h1"));
        assert!(!cache.invalidate("h1"));
        assert!(cache.last_known("h1").is_none());

        // After invalidation any timestamp is accepted again.
        assert_eq!(cache.put(snapshot("h1", 1)), PutOutcome::Stored);
    }
}
