//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: RESOURCE_, nested keys separated by `__`)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/resource-engine/{service_name}/config.toml
//! 4. System directory: /etc/resource-engine/{service_name}/config.toml
//! 5. Default values
//!
//! # Example
//!
//! ```toml
//! [filter]
//! mode = "strict"
//!
//! [batch]
//! max_size = 500
//! chunk_size = 50
//!
//! [cache]
//! list_ttl_secs = 30
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

const ENV_PREFIX: &str = "RESOURCE_";
const XDG_PREFIX: &str = "resource-engine";

/// Longest accepted cache TTL (30 days)
pub const MAX_CACHE_TTL_SECS: u64 = 30 * 24 * 60 * 60;
/// Longest accepted base delay between event deliveries
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;
/// Most delivery attempts accepted per sink
pub const MAX_DELIVERY_ATTEMPTS: u32 = 16;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Engine identity and logging
    pub engine: EngineConfig,

    /// Filter parsing policy
    #[serde(default)]
    pub filter: FilterConfig,

    /// Page size defaults and limits
    #[serde(default)]
    pub pagination: PaginationConfig,

    /// Batch operation limits
    #[serde(default)]
    pub batch: BatchConfig,

    /// Cache regions and TTLs
    #[serde(default)]
    pub cache: CacheConfig,

    /// Domain event dispatch
    #[serde(default)]
    pub events: EventsConfig,

    /// Database configuration (optional)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Redis configuration (optional)
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// NATS configuration (optional)
    #[serde(default)]
    pub nats: Option<NatsConfig>,
}

/// Engine-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine (service) name, used in logs
    pub name: String,

    /// Log level (trace, debug, info, warn, error) or a full `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// How malformed filter input is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    /// Skip malformed clauses and unconvertible values with a logged warning
    #[default]
    Lenient,
    /// Reject malformed clauses and unconvertible values with a validation error
    Strict,
}

/// Filter parsing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Leniency policy for malformed clauses and value conversion
    #[serde(default)]
    pub mode: ParseMode,

    /// Keys of map-style input that never become criteria
    #[serde(default = "default_reserved_keys")]
    pub reserved_keys: Vec<String>,

    /// Maximum number of clauses accepted from one filter expression
    #[serde(default = "default_max_clauses")]
    pub max_clauses: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            mode: ParseMode::default(),
            reserved_keys: default_reserved_keys(),
            max_clauses: default_max_clauses(),
        }
    }
}

/// Pagination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationConfig {
    /// Page size used when a request asks for size 0
    #[serde(default = "default_page_size")]
    pub default_size: u32,

    /// Page sizes above this value are clamped
    #[serde(default = "default_max_page_size")]
    pub max_size: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_size: default_page_size(),
            max_size: default_max_page_size(),
        }
    }
}

/// Batch operation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Inputs larger than this are rejected with a validation error
    #[serde(default = "default_batch_max_size")]
    pub max_size: usize,

    /// Number of entities processed per chunk
    #[serde(default = "default_batch_chunk_size")]
    pub chunk_size: usize,

    /// Time budget for a whole batch operation, in seconds
    #[serde(default = "default_batch_timeout")]
    pub timeout_secs: u64,
}

impl BatchConfig {
    /// Batch time budget as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_batch_max_size(),
            chunk_size: default_batch_chunk_size(),
            timeout_secs: default_batch_timeout(),
        }
    }
}

/// Cache configuration
///
/// Each named region (entities, lists, counts) carries its own TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether read-through caching is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Namespace prepended to backend keys (shared backends only)
    #[serde(default = "default_cache_namespace")]
    pub namespace: String,

    /// TTL for single-entity entries
    #[serde(default = "default_entity_ttl")]
    pub entity_ttl_secs: u64,

    /// TTL for paginated list entries
    #[serde(default = "default_list_ttl")]
    pub list_ttl_secs: u64,

    /// TTL for count entries
    #[serde(default = "default_count_ttl")]
    pub count_ttl_secs: u64,

    /// Upper bound on entries held by the in-process backend
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: default_cache_namespace(),
            entity_ttl_secs: default_entity_ttl(),
            list_ttl_secs: default_list_ttl(),
            count_ttl_secs: default_count_ttl(),
            max_entries: default_cache_max_entries(),
        }
    }
}

/// Domain event dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Whether committed mutations dispatch events at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delivery attempts per sink before an event is dropped
    #[serde(default = "default_delivery_attempts")]
    pub max_delivery_attempts: u32,

    /// Base delay between delivery attempts, doubled on each retry
    #[serde(default = "default_delivery_delay_ms")]
    pub retry_delay_ms: u64,

    /// Subject prefix for transports that route by subject
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_delivery_attempts: default_delivery_attempts(),
            retry_delay_ms: default_delivery_delay_ms(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing database connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing Redis connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Keys fetched per SCAN iteration during prefix eviction
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
}

/// NATS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,

    /// Connection name
    #[serde(default)]
    pub name: Option<String>,

    /// Max reconnection attempts
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: usize,

    /// Maximum retry attempts for initial connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_reserved_keys() -> Vec<String> {
    ["page", "size", "sort", "fields", "filter"]
        .iter()
        .map(|k| (*k).to_string())
        .collect()
}

fn default_max_clauses() -> usize {
    64
}

fn default_page_size() -> u32 {
    20
}

fn default_max_page_size() -> u32 {
    100
}

fn default_batch_max_size() -> usize {
    1000
}

fn default_batch_chunk_size() -> usize {
    100
}

fn default_batch_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_cache_namespace() -> String {
    "resource".to_string()
}

fn default_entity_ttl() -> u64 {
    600
}

fn default_list_ttl() -> u64 {
    60
}

fn default_count_ttl() -> u64 {
    60
}

fn default_cache_max_entries() -> u64 {
    10_000
}

fn default_delivery_attempts() -> u32 {
    3
}

fn default_delivery_delay_ms() -> u64 {
    100
}

fn default_subject_prefix() -> String {
    "resource".to_string()
}

fn default_max_connections() -> u32 {
    50
}

fn default_min_connections() -> u32 {
    5
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_redis_max_connections() -> usize {
    20
}

fn default_scan_count() -> usize {
    500
}

fn default_max_reconnects() -> usize {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

impl Config {
    /// Load configuration from all sources
    ///
    /// The service name is inferred from the running binary.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| XDG_PREFIX.to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Lowest priority first so higher priority files override
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// This bypasses XDG directories and loads directly from the given path.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Returns paths in priority order (highest first)
    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        let xdg_dirs = xdg::BaseDirectories::with_prefix(XDG_PREFIX);
        let config_file_path = Path::new(service_name).join("config.toml");
        if let Some(path) = xdg_dirs.find_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(
            PathBuf::from("/etc")
                .join(XDG_PREFIX)
                .join(service_name)
                .join("config.toml"),
        );

        paths
    }

    /// Check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.batch.max_size == 0 {
            return Err(Error::InvalidConfig("batch.max_size must be > 0".into()));
        }
        if self.batch.chunk_size == 0 {
            return Err(Error::InvalidConfig("batch.chunk_size must be > 0".into()));
        }
        if self.batch.chunk_size > self.batch.max_size {
            return Err(Error::InvalidConfig(
                "batch.chunk_size must not exceed batch.max_size".into(),
            ));
        }
        if self.batch.timeout_secs == 0 {
            return Err(Error::InvalidConfig("batch.timeout_secs must be > 0".into()));
        }
        if self.pagination.default_size == 0 || self.pagination.max_size == 0 {
            return Err(Error::InvalidConfig("pagination sizes must be > 0".into()));
        }
        if self.pagination.default_size > self.pagination.max_size {
            return Err(Error::InvalidConfig(
                "pagination.default_size must not exceed pagination.max_size".into(),
            ));
        }
        if self.cache.namespace.is_empty() || self.cache.namespace.contains(['*', '?', '[']) {
            return Err(Error::InvalidConfig(
                "cache.namespace must be non-empty and free of glob characters".into(),
            ));
        }
        if self.filter.max_clauses == 0 {
            return Err(Error::InvalidConfig("filter.max_clauses must be > 0".into()));
        }
        let ttls = [
            self.cache.entity_ttl_secs,
            self.cache.list_ttl_secs,
            self.cache.count_ttl_secs,
        ];
        if ttls.iter().any(|ttl| *ttl == 0 || *ttl > MAX_CACHE_TTL_SECS) {
            return Err(Error::InvalidConfig(format!(
                "cache TTLs must be between 1 and {} seconds",
                MAX_CACHE_TTL_SECS
            )));
        }
        if self.cache.max_entries == 0 {
            return Err(Error::InvalidConfig("cache.max_entries must be > 0".into()));
        }
        if self.events.max_delivery_attempts == 0
            || self.events.max_delivery_attempts > MAX_DELIVERY_ATTEMPTS
        {
            return Err(Error::InvalidConfig(format!(
                "events.max_delivery_attempts must be between 1 and {}",
                MAX_DELIVERY_ATTEMPTS
            )));
        }
        if self.events.retry_delay_ms > MAX_RETRY_DELAY_MS {
            return Err(Error::InvalidConfig(format!(
                "events.retry_delay_ms must not exceed {}",
                MAX_RETRY_DELAY_MS
            )));
        }
        Ok(())
    }

    /// Get database URL
    pub fn database_url(&self) -> Option<&str> {
        self.database.as_ref().map(|db| db.url.as_str())
    }

    /// Get Redis URL
    pub fn redis_url(&self) -> Option<&str> {
        self.redis.as_ref().map(|r| r.url.as_str())
    }

    /// Get NATS URL
    pub fn nats_url(&self) -> Option<&str> {
        self.nats.as_ref().map(|n| n.url.as_str())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig {
                name: XDG_PREFIX.to_string(),
                log_level: default_log_level(),
            },
            filter: FilterConfig::default(),
            pagination: PaginationConfig::default(),
            batch: BatchConfig::default(),
            cache: CacheConfig::default(),
            events: EventsConfig::default(),
            database: None,
            redis: None,
            nats: None,
        }
    }
}
