//! Shared tier behind the local cache.
//!
//! [`RedisTier`] is the production implementation; [`InMemoryTier`] stands in
//! when Redis is disabled or unreachable at startup, and in unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use tokio::time::Instant;

use super::error::{CacheError, CacheResult};
use super::local::expiry_after;
use super::pattern::glob_match;

/// A remote payload plus how long it has left to live.
///
/// `ttl` is `None` when the key has no expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteValue {
    pub data: Bytes,
    pub ttl: Option<Duration>,
}

#[async_trait]
pub trait RemoteTier: Send + Sync + 'static {
    /// Short label for logs and stats.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> CacheResult<Option<RemoteValue>>;

    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    async fn delete_many(&self, keys: &[String]) -> CacheResult<()>;

    /// Every key matching the Redis glob `pattern`, without duplicates.
    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>>;

    async fn ping(&self) -> CacheResult<()>;
}

const DELETE_CHUNK: usize = 500;

/// Redis-backed tier using a deadpool connection pool.
#[derive(Clone)]
pub struct RedisTier {
    pool: Pool,
    scan_count: usize,
}

impl RedisTier {
    pub fn new(pool: Pool, scan_count: usize) -> Self {
        Self {
            pool,
            scan_count: scan_count.max(1),
        }
    }

    async fn conn(&self, op: &'static str) -> CacheResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| CacheError::remote(op, e))
    }
}

impl std::fmt::Debug for RedisTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.pool.status();
        f.debug_struct("RedisTier")
            .field("pool_size", &status.size)
            .field("pool_available", &status.available)
            .field("scan_count", &self.scan_count)
            .finish()
    }
}

#[async_trait]
impl RemoteTier for RedisTier {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<RemoteValue>> {
        let mut conn = self.conn("get").await?;
        let (data, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .get(key)
            .pttl(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::remote("get", e))?;

        // PTTL: -1 means no expiry, -2 means the key vanished between commands.
        Ok(data.map(|data| RemoteValue {
            data: Bytes::from(data),
            ttl: u64::try_from(pttl).ok().map(Duration::from_millis),
        }))
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn("set").await?;
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        conn.pset_ex::<_, _, ()>(key, value.as_ref(), millis)
            .await
            .map_err(|e| CacheError::remote("set", e))
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn("delete").await?;
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| CacheError::remote("delete", e))
    }

    async fn delete_many(&self, keys: &[String]) -> CacheResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn("delete").await?;
        for chunk in keys.chunks(DELETE_CHUNK) {
            conn.del::<_, ()>(chunk)
                .await
                .map_err(|e| CacheError::remote("delete", e))?;
        }
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.conn("scan").await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::remote("scan", e))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may report a key more than once across iterations.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.conn("ping").await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::remote("ping", e))?;
        Ok(())
    }
}

/// Process-local stand-in for the remote tier.
///
/// Keys expire exactly like Redis keys. [`InMemoryTier::set_available`]
/// simulates an outage so callers can exercise their error paths.
#[derive(Debug, Default)]
pub struct InMemoryTier {
    entries: DashMap<String, (Bytes, Instant)>,
    offline: AtomicBool,
}

impl InMemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value().1 > Instant::now()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, op: &'static str) -> CacheResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::remote(op, "in-memory tier marked unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteTier for InMemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<RemoteValue>> {
        self.check("get")?;
        let found = self.entries.get(key).map(|e| e.value().clone());
        match found {
            Some((data, expires_at)) if expires_at > Instant::now() => Ok(Some(RemoteValue {
                data,
                ttl: Some(expires_at.saturating_duration_since(Instant::now())),
            })),
            Some(_) => {
                self.entries.remove_if(key, |_, (_, at)| *at <= Instant::now());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
        self.check("set")?;
        self.entries
            .insert(key.to_owned(), (value, expiry_after(ttl)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.check("delete")?;
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> CacheResult<()> {
        self.check("delete")?;
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.check("scan")?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().1 > now && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn ping(&self) -> CacheResult<()> {
        self.check("ping")
    }
}
