//! In-memory segment cache with expiration and LRU capacity eviction.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::RwLock;

use super::{LockedFilter, SegmentsStorage, StorageError};
use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::segment::{Segment, SegmentId};

/// Cached segment with its access timestamp.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub segment: Segment,
    pub last_accessed: Instant,
}

/// Default `SegmentsStorage` keeping segments in process memory.
///
/// Recency order is tracked by the LRU list itself; `last_accessed` drives
/// expiration. Capacity is only enforced by `clean`, so stores never fail.
pub struct MemorySegmentsStorage {
    cache: RwLock<LruCache<SegmentId, CacheEntry>>,
    config: CacheConfig,
    clock: SharedClock,
}

impl MemorySegmentsStorage {
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            cache: RwLock::new(LruCache::unbounded()),
            config,
            clock,
        }
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

#[async_trait]
impl SegmentsStorage for MemorySegmentsStorage {
    async fn store_segment(&self, segment: Segment) -> Result<(), StorageError> {
        if segment.data.is_none() {
            return Err(StorageError::MissingData {
                segment_id: segment.id,
            });
        }

        let entry = CacheEntry {
            last_accessed: self.clock.now(),
            segment,
        };
        self.cache.write().await.put(entry.segment.id.clone(), entry);
        Ok(())
    }

    async fn segments_map(
        &self,
        master_swarm_id: &str,
    ) -> Result<HashMap<SegmentId, Segment>, StorageError> {
        let cache = self.cache.read().await;
        Ok(cache
            .iter()
            .filter(|(_, entry)| entry.segment.master_swarm_id == master_swarm_id)
            .map(|(id, entry)| (id.clone(), entry.segment.clone()))
            .collect())
    }

    async fn segment(
        &self,
        id: &SegmentId,
        _master_swarm_id: &str,
    ) -> Result<Option<Segment>, StorageError> {
        let now = self.clock.now();
        let mut cache = self.cache.write().await;
        Ok(cache.get_mut(id).map(|entry| {
            entry.last_accessed = now;
            entry.segment.clone()
        }))
    }

    async fn clean(
        &self,
        _master_swarm_id: &str,
        locked: LockedFilter<'_>,
    ) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let expiration = self.config.cached_segment_expiration;
        let mut cache = self.cache.write().await;

        let expired: Vec<SegmentId> = cache
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_accessed) > expiration)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            cache.pop(id);
        }

        let mut overhead = cache.len().saturating_sub(self.config.cached_segments_count);
        let mut evicted = Vec::new();
        if overhead > 0 {
            // Least recently used first
            for (id, _) in cache.iter().rev() {
                if overhead == 0 {
                    break;
                }
                if !locked(id) {
                    evicted.push(id.clone());
                    overhead -= 1;
                }
            }
        }
        for id in &evicted {
            cache.pop(id);
        }

        let removed = expired.len() + evicted.len();
        if removed > 0 {
            tracing::debug!(
                expired = expired.len(),
                evicted = evicted.len(),
                remaining = cache.len(),
                "Cleaned segment cache"
            );
        }

        Ok(removed > 0)
    }

    async fn destroy(&self) -> Result<(), StorageError> {
        self.cache.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::clock::ManualClock;

    fn loaded(sequence: u32) -> Segment {
        let mut segment = Segment::new("master", None, sequence.to_string(), "http://o/s.ts");
        segment.data = Some(Bytes::from(vec![sequence as u8; 4]));
        segment
    }

    fn storage(count: usize, clock: &ManualClock) -> MemorySegmentsStorage {
        MemorySegmentsStorage::new(
            CacheConfig {
                cached_segment_expiration: Duration::from_secs(60),
                cached_segments_count: count,
            },
            clock.shared(),
        )
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let clock = ManualClock::new();
        let storage = storage(10, &clock);

        storage.store_segment(loaded(1)).await.unwrap();

        let id = SegmentId::new("master+1");
        let segment = storage.segment(&id, "master").await.unwrap().unwrap();
        assert_eq!(segment.data_len(), 4);
        assert!(storage.segment(&SegmentId::new("master+2"), "master").await.unwrap().is_none());
        assert_eq!(storage.segments_map("master").await.unwrap().len(), 1);
        assert!(storage.segments_map("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_requires_data() {
        let clock = ManualClock::new();
        let storage = storage(10, &clock);

        let result = storage
            .store_segment(Segment::new("master", None, "1", "http://o/1.ts"))
            .await;
        assert!(matches!(result, Err(StorageError::MissingData { .. })));
    }

    #[tokio::test]
    async fn test_clean_removes_expired_entries() {
        let clock = ManualClock::new();
        let storage = storage(10, &clock);

        storage.store_segment(loaded(1)).await.unwrap();
        clock.advance(Duration::from_secs(30));
        storage.store_segment(loaded(2)).await.unwrap();
        clock.advance(Duration::from_secs(31));

        // Expired entries go even when locked
        let removed = storage.clean("master", &|_| true).await.unwrap();

        assert!(removed);
        assert_eq!(storage.len().await, 1);
        assert!(storage.segment(&SegmentId::new("master+2"), "master").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clean_evicts_least_recently_accessed_unlocked() {
        let clock = ManualClock::new();
        let storage = storage(2, &clock);

        for sequence in 1..=4 {
            storage.store_segment(loaded(sequence)).await.unwrap();
            clock.advance(Duration::from_millis(10));
        }
        // Touch the oldest so it becomes most recent
        storage.segment(&SegmentId::new("master+1"), "master").await.unwrap();

        let locked: HashSet<SegmentId> = [SegmentId::new("master+2")].into_iter().collect();
        let removed = storage
            .clean("master", &|id| locked.contains(id))
            .await
            .unwrap();

        assert!(removed);
        let remaining = storage.segments_map("master").await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains_key(&SegmentId::new("master+1")));
        assert!(remaining.contains_key(&SegmentId::new("master+2")));
    }

    #[tokio::test]
    async fn test_clean_keeps_everything_when_all_locked() {
        let clock = ManualClock::new();
        let storage = storage(1, &clock);

        for sequence in 1..=3 {
            storage.store_segment(loaded(sequence)).await.unwrap();
        }

        let removed = storage.clean("master", &|_| true).await.unwrap();

        assert!(!removed);
        assert_eq!(storage.len().await, 3);
    }

    #[tokio::test]
    async fn test_destroy_clears_cache() {
        let clock = ManualClock::new();
        let storage = storage(10, &clock);
        storage.store_segment(loaded(1)).await.unwrap();

        storage.destroy().await.unwrap();

        assert!(storage.is_empty().await);
    }
}
