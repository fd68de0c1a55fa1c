use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::CacheConfig;
use crate::error::Result;

/// Named cache region; each has its own TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheRegion {
    /// Single entities by id
    Entities,
    /// Paginated list results
    Lists,
    /// Count results
    Counts,
}

impl CacheRegion {
    /// Every region
    pub const ALL: [CacheRegion; 3] = [Self::Entities, Self::Lists, Self::Counts];

    /// Region name used in backend keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entities => "entities",
            Self::Lists => "lists",
            Self::Counts => "counts",
        }
    }

    /// Configured time-to-live for entries of this region
    pub fn ttl(&self, config: &CacheConfig) -> Duration {
        Duration::from_secs(match self {
            Self::Entities => config.entity_ttl_secs,
            Self::Lists => config.list_ttl_secs,
            Self::Counts => config.count_ttl_secs,
        })
    }
}

impl fmt::Display for CacheRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage behind the read-through cache
///
/// Values are opaque serialized strings. Implementations must be safe for
/// concurrent use.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Look up a live entry
    async fn get(&self, region: CacheRegion, key: &str) -> Result<Option<String>>;

    /// Store an entry with a time-to-live
    async fn put(&self, region: CacheRegion, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Remove one entry; returns whether it existed
    async fn evict(&self, region: CacheRegion, key: &str) -> Result<bool>;

    /// Live keys of `region` starting with `prefix`
    async fn keys_with_prefix(&self, region: CacheRegion, prefix: &str) -> Result<Vec<String>>;

    /// Remove every entry of `region` whose key starts with `prefix`
    ///
    /// Returns the number of entries removed.
    async fn evict_prefix(&self, region: CacheRegion, prefix: &str) -> Result<u64>;

    /// Usage statistics
    async fn stats(&self) -> Result<CacheStats>;
}

/// Statistics about cache usage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Entries currently stored (0 when the backend cannot tell cheaply)
    pub entry_count: u64,
    /// Entries removed by eviction
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate between 0.0 and 1.0
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
