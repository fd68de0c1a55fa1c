use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::config::CacheConfig;
use crate::error::{Result, ResourceResult};

use super::backend::{CacheBackend, CacheRegion, CacheStats};
use super::memory::InMemoryCacheBackend;

/// Typed read-through cache shared by every service of a process
///
/// Values are stored as JSON. Concurrent misses on the same key are collapsed
/// into a single load, and each entity type carries a generation counter:
/// a load that overlapped an eviction of its entity type is returned to the
/// caller but never written back.
///
/// Backend faults never fail a read; they are logged and the value is loaded
/// from the store instead.
pub struct ResourceCache {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
    flights: DashMap<String, Arc<Mutex<()>>>,
    generations: DashMap<String, Arc<RwLock<u64>>>,
}

impl ResourceCache {
    /// Cache over an arbitrary backend
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self {
            backend,
            config,
            flights: DashMap::new(),
            generations: DashMap::new(),
        }
    }

    /// Process-local cache
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(Arc::new(InMemoryCacheBackend::from_config(&config)), config)
    }

    /// Cache backed by Redis, namespaced by `config.namespace`
    #[cfg(feature = "cache")]
    pub async fn redis(redis: &crate::config::RedisConfig, config: CacheConfig) -> Result<Self> {
        let backend = super::redis::RedisCacheBackend::connect(redis, config.namespace.clone()).await?;
        Ok(Self::new(Arc::new(backend), config))
    }

    /// Whether reads go through the cache at all
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The storage backend
    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Backend statistics
    pub async fn stats(&self) -> Result<CacheStats> {
        self.backend.stats().await
    }

    /// Generation counter for one entity type
    ///
    /// Evictions hold the write half while they bump the counter and remove
    /// entries; write-backs hold the read half while they store.
    pub fn generation_lock(&self, entity: &str) -> Arc<RwLock<u64>> {
        self.generations
            .entry(entity.to_string())
            .or_default()
            .clone()
    }

    /// Return the cached value for `key`, or load, cache and return it
    ///
    /// Only present values are cached: `Ok(None)` and errors from `load` are
    /// passed through untouched.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        entity: &str,
        region: CacheRegion,
        key: &str,
        load: F,
    ) -> ResourceResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = ResourceResult<Option<T>>> + Send,
    {
        if !self.config.enabled {
            return load().await;
        }

        if let Some(value) = self.lookup(region, key).await {
            return Ok(Some(value));
        }

        let flight_key = format!("{}/{}", region, key);
        let flight = self.flights.entry(flight_key.clone()).or_default().clone();

        let loaded = {
            let _turn = flight.lock().await;
            match self.lookup(region, key).await {
                Some(value) => Ok(Some(value)),
                None => self.load_and_store(entity, region, key, load).await,
            }
        };

        drop(flight);
        self.flights
            .remove_if(&flight_key, |_, waiting| Arc::strong_count(waiting) == 1);

        loaded
    }

    async fn load_and_store<T, F, Fut>(
        &self,
        entity: &str,
        region: CacheRegion,
        key: &str,
        load: F,
    ) -> ResourceResult<Option<T>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResourceResult<Option<T>>>,
    {
        let generation = self.generation_lock(entity);
        let observed = *generation.read().await;

        let loaded = load().await?;
        let Some(value) = loaded else {
            return Ok(None);
        };

        let current = generation.read().await;
        if *current != observed {
            tracing::debug!(
                entity,
                key,
                "Skipping cache write-back: entity type was evicted during load"
            );
            return Ok(Some(value));
        }

        match serde_json::to_string(&value) {
            Ok(json) => {
                if let Err(e) = self
                    .backend
                    .put(region, key, json, region.ttl(&self.config))
                    .await
                {
                    tracing::warn!(
                        backend = self.backend.name(),
                        region = %region,
                        key,
                        "Cache write failed: {}",
                        e
                    );
                }
            }
            Err(e) => tracing::warn!(key, "Value not cacheable: {}", e),
        }
        drop(current);

        Ok(Some(value))
    }

    async fn lookup<T: DeserializeOwned>(&self, region: CacheRegion, key: &str) -> Option<T> {
        match self.backend.get(region, key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    tracing::trace!(region = %region, key, "Cache hit");
                    Some(value)
                }
                Err(e) => {
                    tracing::warn!(region = %region, key, "Dropping undecodable cache entry: {}", e);
                    if let Err(e) = self.backend.evict(region, key).await {
                        tracing::warn!(key, "Failed to evict undecodable entry: {}", e);
                    }
                    None
                }
            },
            Ok(None) => {
                tracing::trace!(region = %region, key, "Cache miss");
                None
            }
            Err(e) => {
                tracing::warn!(
                    backend = self.backend.name(),
                    region = %region,
                    key,
                    "Cache read failed, falling back to store: {}",
                    e
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("backend", &self.backend.name())
            .field("enabled", &self.config.enabled)
            .finish()
    }
}
