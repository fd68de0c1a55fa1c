//! Read-through caching with entity-scoped eviction
//!
//! # Features
//!
//! - **Regions**: entities, lists and counts, each with its own TTL
//! - **Read-through**: [`ResourceCache::get_or_load`] collapses concurrent
//!   misses into one load and never caches absent values or errors
//! - **Selective eviction**: [`CacheEvictionService`] removes only keys under
//!   the `{Entity}:` prefix of the entity type that changed
//! - **Backends**: [`InMemoryCacheBackend`] (default) and `RedisCacheBackend`
//!   with the `cache` feature
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use resource_engine::cache::{CacheEvictionService, CacheKeys, CacheRegion, ResourceCache};
//!
//! let cache = Arc::new(ResourceCache::in_memory(config.cache.clone()));
//! let widget: Option<Widget> = cache
//!     .get_or_load("Widget", CacheRegion::Entities, &CacheKeys::entity("Widget", 1), || load(1))
//!     .await?;
//!
//! CacheEvictionService::new(cache).evict_all("Widget", Some("1")).await?;
//! ```

mod backend;
mod eviction;
mod keys;
mod memory;
mod read_through;
#[cfg(feature = "cache")]
mod redis;

pub use backend::{CacheBackend, CacheRegion, CacheStats};
pub use eviction::CacheEvictionService;
pub use keys::CacheKeys;
pub use memory::InMemoryCacheBackend;
pub use read_through::ResourceCache;
#[cfg(feature = "cache")]
pub use self::redis::RedisCacheBackend;
