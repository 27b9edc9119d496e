use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

use crate::cache::KeyFamily;
use lightnovel_core::HeartbeatPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,
    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// WebSocket push configuration
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.redis.enabled && self.redis.url.trim().is_empty() {
            return Err("redis.enabled=true requires redis.url".into());
        }
        if self.redis.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        if self.redis.timeout_ms == 0 {
            return Err("redis.timeout_ms must be > 0".into());
        }
        if self.cache.default_ttl_secs == 0 {
            return Err("cache.default_ttl_secs must be > 0".into());
        }
        if self.cache.local_max_entries == 0 {
            return Err("cache.local_max_entries must be > 0".into());
        }
        if self.scheduler.workers == 0 {
            return Err("scheduler.workers must be > 0".into());
        }
        if self.realtime.send_queue_capacity == 0 {
            return Err("realtime.send_queue_capacity must be > 0".into());
        }
        if self.realtime.pong_wait_secs < 2 {
            return Err("realtime.pong_wait_secs must be >= 2".into());
        }
        if self.realtime.write_wait_secs == 0 {
            return Err("realtime.write_wait_secs must be > 0".into());
        }
        if self.realtime.reap_interval_secs == 0 {
            return Err("realtime.reap_interval_secs must be > 0".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        let ip: std::net::IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(std::net::IpAddr::from([0, 0, 0, 0]));
        SocketAddr::new(ip, self.server.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Redis configuration for the remote cache tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Use Redis as the shared tier. Falls back to an in-process tier when
    /// disabled or unreachable at startup.
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Per-call timeout in milliseconds, also used for pool waits
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// `COUNT` hint for each `SCAN` iteration
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
}

fn default_redis_enabled() -> bool {
    true
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    100
}

fn default_redis_timeout_ms() -> u64 {
    2000
}

fn default_scan_count() -> usize {
    100
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            scan_count: default_scan_count(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Namespace prepended to every key in both tiers
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// TTL used when a caller passes zero
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,
    /// Payloads larger than this skip the local tier
    #[serde(default = "default_local_max_entry_bytes")]
    pub local_max_entry_bytes: usize,
    #[serde(default)]
    pub ttl: CacheTtlConfig,
}

fn default_key_prefix() -> String {
    "lightnovel:".to_string()
}

fn default_ttl_secs() -> u64 {
    600
}

fn default_local_max_entries() -> usize {
    10_000
}

fn default_local_max_entry_bytes() -> usize {
    1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            default_ttl_secs: default_ttl_secs(),
            local_max_entries: default_local_max_entries(),
            local_max_entry_bytes: default_local_max_entry_bytes(),
            ttl: CacheTtlConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// TTL for a content family; user state uses the default TTL.
    pub fn ttl_for(&self, family: KeyFamily) -> Duration {
        let t = &self.ttl;
        let secs = match family {
            KeyFamily::NovelList => t.novel_list_secs,
            KeyFamily::NovelDetail => t.novel_detail_secs,
            KeyFamily::VolumeList => t.volume_list_secs,
            KeyFamily::ChapterList => t.chapter_list_secs,
            KeyFamily::ChapterDetail => t.chapter_detail_secs,
            KeyFamily::SearchResult => t.search_result_secs,
            KeyFamily::LatestNovels => t.latest_novels_secs,
            KeyFamily::PopularNovels => t.popular_novels_secs,
            KeyFamily::UserState => self.default_ttl_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Per-family TTLs in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtlConfig {
    pub novel_list_secs: u64,
    pub novel_detail_secs: u64,
    pub volume_list_secs: u64,
    pub chapter_list_secs: u64,
    pub chapter_detail_secs: u64,
    pub search_result_secs: u64,
    pub latest_novels_secs: u64,
    pub popular_novels_secs: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            novel_list_secs: 900,
            novel_detail_secs: 1800,
            volume_list_secs: 1200,
            chapter_list_secs: 1200,
            chapter_detail_secs: 3600,
            search_result_secs: 600,
            latest_novels_secs: 300,
            popular_novels_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Workers in the shared task scheduler, which also runs the cache's
    /// MultiGet/MultiSet fan-out
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    num_cpus::get()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Per-connection outbound queue depth before the client counts as slow
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    /// Liveness window: a client silent for longer is dropped
    #[serde(default = "default_pong_wait_secs")]
    pub pong_wait_secs: u64,
    #[serde(default = "default_write_wait_secs")]
    pub write_wait_secs: u64,
    /// Largest inbound frame accepted from a client
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

fn default_send_queue_capacity() -> usize {
    256
}

fn default_pong_wait_secs() -> u64 {
    60
}

fn default_write_wait_secs() -> u64 {
    10
}

fn default_max_message_size() -> usize {
    512
}

fn default_reap_interval_secs() -> u64 {
    30
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: default_send_queue_capacity(),
            pong_wait_secs: default_pong_wait_secs(),
            write_wait_secs: default_write_wait_secs(),
            max_message_size: default_max_message_size(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

impl RealtimeConfig {
    pub fn heartbeat(&self) -> HeartbeatPolicy {
        HeartbeatPolicy::from_pong_wait(
            Duration::from_secs(self.pong_wait_secs),
            Duration::from_secs(self.write_wait_secs),
        )
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    pub const DEFAULT_CONFIG_FILE: &str = "lightnovel.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., LIGHTNOVEL__REDIS__URL=redis://cache:6379
        builder = builder.add_source(
            Environment::with_prefix("LIGHTNOVEL")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn load_config_with_default_path<P: AsRef<Path>>(
        path: Option<P>,
    ) -> Result<AppConfig, String> {
        let p = path
            .as_ref()
            .map(|p| p.as_ref().to_string_lossy().to_string());
        load_config(p.as_deref())
    }
}
