use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::{CacheConfig, MAX_CACHE_TTL_SECS};
use crate::error::Result;

use super::backend::{CacheBackend, CacheRegion, CacheStats};

type EntryKey = (CacheRegion, String);

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    ttl: Duration,
}

/// Expires every entry after the TTL it was stored with
struct PerEntryTtl;

impl Expiry<EntryKey, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &EntryKey, entry: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &EntryKey,
        entry: &Entry,
        _updated_at: Instant,
        _remaining: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Process-local cache backend
///
/// Entries are reclaimed once their TTL passes, and the least useful ones are
/// dropped when the backend grows past its capacity.
pub struct InMemoryCacheBackend {
    entries: Cache<EntryKey, Entry>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl InMemoryCacheBackend {
    /// Empty backend with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(CacheConfig::default().max_entries)
    }

    /// Empty backend holding at most `max_entries` entries
    pub fn with_capacity(max_entries: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_entries)
                .expire_after(PerEntryTtl)
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Backend sized by `cache.max_entries`
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::with_capacity(config.max_entries)
    }

    /// Approximate number of stored entries
    ///
    /// Exact after [`run_pending_tasks`](Self::run_pending_tasks).
    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply pending expirations and capacity evictions now
    pub async fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks().await;
    }
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryCacheBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCacheBackend")
            .field("entries", &self.entries.entry_count())
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, region: CacheRegion, key: &str) -> Result<Option<String>> {
        match self.entries.get(&(region, key.to_string())).await {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.value))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(&self, region: CacheRegion, key: &str, value: String, ttl: Duration) -> Result<()> {
        let ttl = ttl.min(Duration::from_secs(MAX_CACHE_TTL_SECS));
        self.entries
            .insert((region, key.to_string()), Entry { value, ttl })
            .await;
        Ok(())
    }

    async fn evict(&self, region: CacheRegion, key: &str) -> Result<bool> {
        let removed = self.entries.remove(&(region, key.to_string())).await.is_some();
        if removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    async fn keys_with_prefix(&self, region: CacheRegion, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, _)| key.0 == region && key.1.starts_with(prefix))
            .map(|(key, _)| key.1.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn evict_prefix(&self, region: CacheRegion, prefix: &str) -> Result<u64> {
        let matching: Vec<EntryKey> = self
            .entries
            .iter()
            .filter(|(key, _)| key.0 == region && key.1.starts_with(prefix))
            .map(|(key, _)| (*key).clone())
            .collect();

        let mut removed = 0u64;
        for key in matching {
            if self.entries.remove(&key).await.is_some() {
                removed += 1;
            }
        }
        self.evictions.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats> {
        self.entries.run_pending_tasks().await;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.entry_count(),
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_put_get_and_stats() {
        let backend = InMemoryCacheBackend::new();
        backend
            .put(CacheRegion::Entities, "Widget:id:1", "{}".to_string(), TTL)
            .await
            .unwrap();

        assert_eq!(
            backend.get(CacheRegion::Entities, "Widget:id:1").await.unwrap(),
            Some("{}".to_string())
        );
        assert!(backend.get(CacheRegion::Lists, "Widget:id:1").await.unwrap().is_none());

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let backend = InMemoryCacheBackend::new();
        backend
            .put(
                CacheRegion::Counts,
                "Widget:count:filter-all",
                "3".to_string(),
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        backend
            .put(CacheRegion::Entities, "Widget:id:1", "{}".to_string(), TTL)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(backend
            .get(CacheRegion::Counts, "Widget:count:filter-all")
            .await
            .unwrap()
            .is_none());
        assert!(backend
            .get(CacheRegion::Entities, "Widget:id:1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_expired_entries_are_reclaimed_without_being_read() {
        let backend = InMemoryCacheBackend::new();
        for page in 0..1_000 {
            let key = format!("Widget:list:page{}:size20:sort-none:filter-x", page);
            backend
                .put(CacheRegion::Lists, &key, "[]".to_string(), Duration::from_millis(100))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        backend.run_pending_tasks().await;

        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_bounds_entry_count() {
        let backend = InMemoryCacheBackend::with_capacity(50);
        for n in 0..1_000 {
            let key = format!("Widget:count:filter-{}", n);
            backend
                .put(CacheRegion::Counts, &key, n.to_string(), TTL)
                .await
                .unwrap();
        }
        backend.run_pending_tasks().await;

        assert!(backend.len() <= 50);
    }

    #[tokio::test]
    async fn test_oversized_ttl_is_capped() {
        let backend = InMemoryCacheBackend::new();
        backend
            .put(CacheRegion::Entities, "Widget:id:1", "{}".to_string(), Duration::MAX)
            .await
            .unwrap();
        assert!(backend.get(CacheRegion::Entities, "Widget:id:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_evict_prefix_is_region_and_prefix_scoped() {
        let backend = InMemoryCacheBackend::new();
        for (region, key) in [
            (CacheRegion::Lists, "Widget:list:a"),
            (CacheRegion::Lists, "Widget:list:b"),
            (CacheRegion::Lists, "WidgetPart:list:a"),
            (CacheRegion::Entities, "Widget:id:1"),
        ] {
            backend.put(region, key, "x".to_string(), TTL).await.unwrap();
        }

        assert_eq!(
            backend
                .keys_with_prefix(CacheRegion::Lists, "Widget:")
                .await
                .unwrap(),
            vec!["Widget:list:a".to_string(), "Widget:list:b".to_string()]
        );

        let removed = backend.evict_prefix(CacheRegion::Lists, "Widget:").await.unwrap();
        assert_eq!(removed, 2);
        assert!(backend
            .get(CacheRegion::Lists, "WidgetPart:list:a")
            .await
            .unwrap()
            .is_some());
        assert!(backend.get(CacheRegion::Entities, "Widget:id:1").await.unwrap().is_some());
        assert_eq!(backend.stats().await.unwrap().evictions, 2);
    }

    #[tokio::test]
    async fn test_evict_single_key() {
        let backend = InMemoryCacheBackend::new();
        backend
            .put(CacheRegion::Entities, "Widget:id:1", "x".to_string(), TTL)
            .await
            .unwrap();
        assert!(backend.evict(CacheRegion::Entities, "Widget:id:1").await.unwrap());
        assert!(!backend.evict(CacheRegion::Entities, "Widget:id:1").await.unwrap());
    }
}
