use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Default lifetime of a negative cache entry since it was last seen.
pub const DEFAULT_NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(120);

/// NegativeCache remembers asset ids which are known to be of a type that
/// may not be served, so that repeated requests for them are refused without
/// a round-trip to the asset store.
///
/// Entries expire on a sliding window: each hit extends the entry's lifetime.
/// Lookups take only a read lock, and slide the entry through an atomic
/// timestamp, so that concurrent readers don't contend.
pub struct NegativeCache {
    ttl: Duration,
    epoch: Instant,
    // Milliseconds since `epoch` at which each asset was last seen.
    entries: RwLock<HashMap<Uuid, AtomicU64>>,
    hits: AtomicU64,
}

impl NegativeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            epoch: Instant::now(),
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
        }
    }

    fn now(&self) -> u64 {
        Instant::now().duration_since(self.epoch).as_millis() as u64
    }

    fn is_live(&self, last_seen: u64, now: u64) -> bool {
        now.saturating_sub(last_seen) < self.ttl.as_millis() as u64
    }

    /// Returns true if `id` is present and unexpired, sliding its expiry.
    pub fn contains(&self, id: &Uuid) -> bool {
        let now = self.now();
        let entries = self.entries.read().unwrap();

        let Some(last_seen) = entries.get(id) else {
            return false;
        };
        if !self.is_live(last_seen.load(Ordering::Acquire), now) {
            return false;
        }

        last_seen.fetch_max(now, Ordering::AcqRel);
        self.hits.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Insert `id`, or refresh it if already present.
    pub fn insert(&self, id: Uuid) {
        let now = self.now();
        self.entries
            .write()
            .unwrap()
            .insert(id, AtomicU64::new(now));
    }

    /// Remove all expired entries, returning the number removed.
    pub fn prune_expired(&self) -> usize {
        let now = self.now();
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();

        entries.retain(|_, last_seen| self.is_live(last_seen.load(Ordering::Acquire), now));

        let pruned = before - entries.len();
        tracing::debug!(
            pruned,
            remaining = entries.len(),
            "pruned expired negative cache entries"
        );
        pruned
    }

    /// Number of entries, including any which have expired but are not yet pruned.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of lookups which found a live entry.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = NegativeCache::new(Duration::from_secs(120));
        let id = Uuid::new_v4();

        assert!(!cache.contains(&id));
        cache.insert(id);
        assert!(cache.contains(&id));

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(!cache.contains(&id));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.prune_expired(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.hits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hits_slide_the_expiry() {
        let cache = NegativeCache::new(Duration::from_secs(120));
        let id = Uuid::new_v4();
        cache.insert(id);

        // Each hit lands within the window of the one before it,
        // well past the window of the original insertion.
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(100)).await;
            assert!(cache.contains(&id));
        }
        assert_eq!(cache.prune_expired(), 0);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(!cache.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_keeps_live_entries() {
        let cache = NegativeCache::new(Duration::from_secs(10));
        let (stale, fresh) = (Uuid::new_v4(), Uuid::new_v4());

        cache.insert(stale);
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.insert(fresh);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.prune_expired(), 1);
        assert!(!cache.contains(&stale));
        assert!(cache.contains(&fresh));
    }
}
