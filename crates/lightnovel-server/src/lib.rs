pub mod cache;
pub mod config;
pub mod metrics;
pub mod observability;
pub mod realtime;
pub mod server;

use std::sync::Arc;

pub use cache::{
    CacheError, CacheResult, ContentInvalidator, InMemoryTier, RedisTier, RemoteTier, TieredCache,
    TieredCacheOptions,
};
pub use config::{
    AppConfig, CacheConfig, LoggingConfig, RealtimeConfig, RedisConfig, SchedulerConfig,
    ServerConfig,
};
pub use observability::init_tracing;
pub use realtime::{Notifier, RealtimeSettings};
pub use server::{AppState, LightnovelServer, ServerBuilder, build_app, build_state};

/// Create the remote cache tier based on configuration.
///
/// ## Tier Selection
///
/// - **Redis disabled**: in-process [`InMemoryTier`]
/// - **Redis enabled**: connects and pings Redis, falling back to the
///   in-process tier on failure
///
/// ## Graceful Degradation
///
/// Startup never fails on Redis. A fallback instance keeps serving, but its
/// cache is no longer shared with other instances.
pub async fn create_remote_tier(config: &RedisConfig) -> Arc<dyn RemoteTier> {
    if !config.enabled {
        tracing::info!("Redis disabled, using in-process remote tier");
        return Arc::new(InMemoryTier::new());
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let timeout = config.timeout();
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);
    redis_config.pool = Some(pool_config);

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to in-process tier."
            );
            return Arc::new(InMemoryTier::new());
        }
    };

    let tier = RedisTier::new(pool, config.scan_count);
    match tokio::time::timeout(timeout, tier.ping()).await {
        Ok(Ok(())) => {
            tracing::info!("Connected to Redis");
            Arc::new(tier)
        }
        Ok(Err(e)) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to in-process tier."
            );
            Arc::new(InMemoryTier::new())
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = config.timeout_ms,
                "Redis did not answer in time. Falling back to in-process tier."
            );
            Arc::new(InMemoryTier::new())
        }
    }
}
