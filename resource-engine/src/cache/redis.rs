//! Redis cache backend
//!
//! Keys are laid out as `{namespace}:{region}:{key}` and written with `SET EX`.
//! Prefix eviction walks the keyspace with `SCAN MATCH` (never `KEYS`) and
//! deletes each page of matches.

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Config as DeadpoolConfig, Pool, Runtime};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::RedisConfig;
use crate::error::{Error, Result};

use super::backend::{CacheBackend, CacheRegion, CacheStats};

/// Shared cache backend on a Redis connection pool
pub struct RedisCacheBackend {
    pool: Pool,
    namespace: String,
    scan_count: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl RedisCacheBackend {
    /// Wrap an existing pool
    pub fn new(pool: Pool, namespace: impl Into<String>, scan_count: usize) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            scan_count: scan_count.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Connect with retries as configured
    pub async fn connect(config: &RedisConfig, namespace: impl Into<String>) -> Result<Self> {
        let pool = create_pool_with_retries(config, config.max_retries).await?;
        Ok(Self::new(pool, namespace, config.scan_count))
    }

    fn key(&self, region: CacheRegion, key: &str) -> String {
        format!("{}:{}:{}", self.namespace, region, key)
    }

    /// One `SCAN MATCH` page of full keys under `prefix`
    async fn scan_page(
        &self,
        conn: &mut deadpool_redis::Connection,
        region: CacheRegion,
        prefix: &str,
        cursor: u64,
    ) -> Result<(u64, Vec<String>)> {
        let pattern = format!("{}*", escape_glob(&self.key(region, prefix)));
        let page: (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(self.scan_count)
            .query_async(conn)
            .await?;
        Ok(page)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::Internal(format!("Failed to get Redis connection: {}", e)))
    }
}

/// Escape Redis glob metacharacters so a prefix matches literally
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, region: CacheRegion, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(self.key(region, key)).await?;
        let counter = if value.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn put(&self, region: CacheRegion, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(self.key(region, key), value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn evict(&self, region: CacheRegion, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn.del(self.key(region, key)).await?;
        self.evictions.fetch_add(removed, Ordering::Relaxed);
        Ok(removed > 0)
    }

    async fn keys_with_prefix(&self, region: CacheRegion, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let strip = self.key(region, "");
        let mut found = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, keys) = self.scan_page(&mut conn, region, prefix, cursor).await?;
            found.extend(
                keys.into_iter()
                    .filter_map(|key| key.strip_prefix(&strip).map(str::to_string)),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        found.sort();
        found.dedup();
        Ok(found)
    }

    async fn evict_prefix(&self, region: CacheRegion, prefix: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let mut cursor = 0;
        let mut removed = 0u64;

        loop {
            let (next, keys) = self.scan_page(&mut conn, region, prefix, cursor).await?;
            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await?;
                removed += deleted;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        tracing::debug!(region = %region, prefix, removed, "Redis prefix eviction");
        self.evictions.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: 0,
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }
}

/// Create a Redis connection pool with configurable retries
///
/// Uses exponential backoff strategy for retries
async fn create_pool_with_retries(config: &RedisConfig, max_retries: u32) -> Result<Pool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!(
                        "Redis connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!(
                        "Redis connection pool created: max_connections={}",
                        config.max_connections
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > max_retries {
                    tracing::error!(
                        "Failed to connect to Redis after {} attempts: {}",
                        max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    "Redis connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Attempt to create a Redis pool (single try)
async fn try_create_pool(config: &RedisConfig) -> Result<Pool> {
    let pool = DeadpoolConfig::from_url(&config.url)
        .builder()
        .map_err(|e| Error::Internal(format!("Failed to build Redis pool: {}", e)))?
        .max_size(config.max_connections)
        .wait_timeout(Some(Duration::from_secs(config.connection_timeout_secs)))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create Redis pool: {}", e)))?;

    // Fail fast when the server is unreachable
    let conn = pool
        .get()
        .await
        .map_err(|e| Error::Internal(format!("Failed to get Redis connection: {}", e)))?;
    drop(conn);

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("resource:lists:Widget:"), "resource:lists:Widget:");
        assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }
}
