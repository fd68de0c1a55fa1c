use std::sync::Arc;

use crate::error::Result;

use super::backend::CacheRegion;
use super::keys::CacheKeys;
use super::read_through::ResourceCache;

enum Scope {
    Key(String),
    Prefix(String),
}

/// Entity-scoped cache invalidation
///
/// List and count eviction only ever removes keys under the `{Entity}:`
/// prefix of the affected type; entries of other entity types sharing the
/// same region stay warm. Every eviction bumps the entity type's generation
/// so that loads already in flight do not write stale values back.
#[derive(Debug, Clone)]
pub struct CacheEvictionService {
    cache: Arc<ResourceCache>,
}

impl CacheEvictionService {
    /// Evict through `cache`
    pub fn new(cache: Arc<ResourceCache>) -> Self {
        Self { cache }
    }

    /// Remove the single-entity entry for `id`
    pub async fn evict_entity(&self, entity: &str, id: &str) -> Result<u64> {
        self.invalidate(
            entity,
            vec![(CacheRegion::Entities, Scope::Key(CacheKeys::entity(entity, id)))],
        )
        .await
    }

    /// Remove every cached list page of `entity`
    pub async fn evict_lists_by_entity_name(&self, entity: &str) -> Result<u64> {
        self.invalidate(
            entity,
            vec![(CacheRegion::Lists, Scope::Prefix(CacheKeys::prefix(entity)))],
        )
        .await
    }

    /// Remove every cached count of `entity`
    pub async fn evict_counts(&self, entity: &str) -> Result<u64> {
        self.invalidate(
            entity,
            vec![(CacheRegion::Counts, Scope::Prefix(CacheKeys::prefix(entity)))],
        )
        .await
    }

    /// Remove the entity entry (when `id` is given) plus all lists and counts
    pub async fn evict_all(&self, entity: &str, id: Option<&str>) -> Result<u64> {
        let prefix = CacheKeys::prefix(entity);
        let mut targets = Vec::with_capacity(3);
        if let Some(id) = id {
            targets.push((CacheRegion::Entities, Scope::Key(CacheKeys::entity(entity, id))));
        }
        targets.push((CacheRegion::Lists, Scope::Prefix(prefix.clone())));
        targets.push((CacheRegion::Counts, Scope::Prefix(prefix)));
        self.invalidate(entity, targets).await
    }

    /// Keys currently cached for `entity` in `region`
    pub async fn cached_keys(&self, entity: &str, region: CacheRegion) -> Result<Vec<String>> {
        self.cache
            .backend()
            .keys_with_prefix(region, &CacheKeys::prefix(entity))
            .await
    }

    /// Number of evictions performed for `entity` so far
    pub async fn generation(&self, entity: &str) -> u64 {
        *self.cache.generation_lock(entity).read().await
    }

    async fn invalidate(&self, entity: &str, targets: Vec<(CacheRegion, Scope)>) -> Result<u64> {
        if !self.cache.is_enabled() {
            return Ok(0);
        }

        let generation = self.cache.generation_lock(entity);
        let mut current = generation.write().await;
        *current += 1;

        let backend = self.cache.backend();
        let mut removed = 0;
        for (region, scope) in targets {
            removed += match scope {
                Scope::Key(key) => u64::from(backend.evict(region, &key).await?),
                Scope::Prefix(prefix) => backend.evict_prefix(region, &prefix).await?,
            };
        }

        tracing::debug!(entity, generation = *current, removed, "Cache entries evicted");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(60);

    async fn seeded() -> (Arc<ResourceCache>, CacheEvictionService) {
        let cache = Arc::new(ResourceCache::in_memory(CacheConfig::default()));
        let backend = cache.backend();
        for (region, key) in [
            (CacheRegion::Entities, "Widget:id:1"),
            (CacheRegion::Entities, "Widget:id:2"),
            (CacheRegion::Lists, "Widget:list:page0:size20:sort-none:filter-all"),
            (CacheRegion::Lists, "Person:list:page0:size20:sort-none:filter-all"),
            (CacheRegion::Counts, "Widget:count:filter-all"),
            (CacheRegion::Counts, "WidgetPart:count:filter-all"),
        ] {
            backend.put(region, key, "1".to_string(), TTL).await.unwrap();
        }
        let eviction = CacheEvictionService::new(cache.clone());
        (cache, eviction)
    }

    #[tokio::test]
    async fn test_evict_entity_removes_only_that_id() {
        let (_cache, eviction) = seeded().await;
        assert_eq!(eviction.evict_entity("Widget", "1").await.unwrap(), 1);
        assert_eq!(
            eviction
                .cached_keys("Widget", CacheRegion::Entities)
                .await
                .unwrap(),
            vec!["Widget:id:2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_list_and_count_eviction_is_prefix_scoped() {
        let (_cache, eviction) = seeded().await;

        assert_eq!(eviction.evict_lists_by_entity_name("Widget").await.unwrap(), 1);
        assert_eq!(eviction.evict_counts("Widget").await.unwrap(), 1);

        assert_eq!(
            eviction.cached_keys("Person", CacheRegion::Lists).await.unwrap().len(),
            1
        );
        assert_eq!(
            eviction
                .cached_keys("WidgetPart", CacheRegion::Counts)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            eviction.cached_keys("Widget", CacheRegion::Entities).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_evict_all_bumps_generation() {
        let (_cache, eviction) = seeded().await;
        assert_eq!(eviction.generation("Widget").await, 0);

        let removed = eviction.evict_all("Widget", Some("2")).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(eviction.generation("Widget").await, 1);
        assert_eq!(eviction.generation("Person").await, 0);

        let removed = eviction.evict_all("Widget", None).await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(eviction.generation("Widget").await, 2);
    }

    #[tokio::test]
    async fn test_disabled_cache_evicts_nothing() {
        let cache = Arc::new(ResourceCache::in_memory(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        }));
        let eviction = CacheEvictionService::new(cache);
        assert_eq!(eviction.evict_all("Widget", Some("1")).await.unwrap(), 0);
    }
}
