//! Read-through two-tier cache.
//!
//! ```text
//! get ──► local (DashMap) ──hit──► value
//!             │ miss
//!             ▼
//!          remote (Redis) ──hit──► promote to local ──► value
//!             │ miss
//!             ▼
//!           Ok(None)
//! ```
//!
//! Writes go to the local tier first and then to the remote tier; a failed
//! remote write rolls the local copy back so a later read cannot observe a
//! value the shared tier never accepted. Deletes clear the local tier before
//! touching the remote one, then bump an invalidation generation and clear
//! it again. A read only promotes a remote hit if the generation it saw
//! before going remote is still current, so a read racing a delete cannot
//! put the deleted value back.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use lightnovel_core::{TaskError, TaskScheduler, task_fn};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{CacheError, CacheResult};
use super::keys::{self, KeyFamily};
use super::local::LocalTier;
use super::pattern;
use super::remote::{RemoteTier, RemoteValue};
use crate::config::{CacheConfig, RedisConfig};
use crate::metrics;

/// Longest TTL a write is stored with. Redis rejects expiries that overflow
/// its millisecond clock.
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Tunables for [`TieredCache`].
#[derive(Debug, Clone)]
pub struct TieredCacheOptions {
    pub key_prefix: String,
    pub default_ttl: Duration,
    pub local_max_entries: usize,
    pub local_max_entry_bytes: usize,
    /// Upper bound on each remote call
    pub op_timeout: Duration,
    /// TTL applied to a zero-TTL write, by key family
    pub family_ttls: HashMap<KeyFamily, Duration>,
}

impl TieredCacheOptions {
    pub fn from_config(cache: &CacheConfig, redis: &RedisConfig) -> Self {
        Self {
            key_prefix: cache.key_prefix.clone(),
            default_ttl: cache.default_ttl(),
            local_max_entries: cache.local_max_entries,
            local_max_entry_bytes: cache.local_max_entry_bytes,
            op_timeout: redis.timeout(),
            family_ttls: [
                KeyFamily::NovelList,
                KeyFamily::NovelDetail,
                KeyFamily::VolumeList,
                KeyFamily::ChapterList,
                KeyFamily::ChapterDetail,
                KeyFamily::SearchResult,
                KeyFamily::LatestNovels,
                KeyFamily::PopularNovels,
            ]
            .into_iter()
            .map(|family| (family, cache.ttl_for(family)))
            .collect(),
        }
    }
}

impl Default for TieredCacheOptions {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default(), &RedisConfig::default())
    }
}

/// Local-tier statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub local_entries: usize,
    pub remote_tier: &'static str,
}

struct Inner {
    local: LocalTier,
    remote: Arc<dyn RemoteTier>,
    key_prefix: String,
    default_ttl: Duration,
    family_ttls: HashMap<KeyFamily, Duration>,
    /// Bumped by every delete once its remote half has run.
    invalidations: AtomicU64,
}

/// Two-tier cache shared across handlers.
///
/// Cloning is cheap; clones share both tiers and the batch scheduler.
#[derive(Clone)]
pub struct TieredCache {
    inner: Arc<Inner>,
    scheduler: Arc<TaskScheduler>,
    op_timeout: Duration,
}

enum Slot<R> {
    Ready(CacheResult<R>),
    Pending(oneshot::Receiver<CacheResult<R>>),
}

impl TieredCache {
    /// Build a cache over `remote`. `scheduler` runs the per-key work of the
    /// batch operations and must already be started.
    pub fn new(
        remote: Arc<dyn RemoteTier>,
        scheduler: Arc<TaskScheduler>,
        options: TieredCacheOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local: LocalTier::new(options.local_max_entries, options.local_max_entry_bytes),
                remote,
                key_prefix: options.key_prefix,
                default_ttl: options.default_ttl,
                family_ttls: options.family_ttls,
                invalidations: AtomicU64::new(0),
            }),
            scheduler,
            op_timeout: options.op_timeout,
        }
    }

    /// A handle whose remote calls give up after `deadline` instead of the
    /// configured timeout.
    pub fn with_deadline(&self, deadline: Duration) -> Self {
        Self {
            op_timeout: deadline,
            ..self.clone()
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let Some(data) = self.get_raw(key).await? else {
            return Ok(None);
        };
        self.decode(key, &data).map(Some)
    }

    pub async fn get_raw(&self, key: &str) -> CacheResult<Option<Bytes>> {
        let full = self.full_key(key);
        if let Some(data) = self.inner.local.get(&full) {
            debug!(key = %full, "cache hit (local)");
            metrics::record_cache_hit("local");
            return Ok(Some(data));
        }

        let seen = self.inner.invalidations.load(Ordering::SeqCst);
        match self.remote_call("get", self.inner.remote.get(&full)).await? {
            Some(RemoteValue { data, ttl }) => {
                debug!(key = %full, "cache hit (remote)");
                metrics::record_cache_hit("remote");
                let ttl = ttl.map_or(self.inner.default_ttl, |t| t.min(self.inner.default_ttl));
                if !ttl.is_zero() {
                    let still_current = || self.inner.invalidations.load(Ordering::SeqCst) == seen;
                    match self.inner.local.insert_if(&full, data.clone(), ttl, still_current) {
                        Ok(true) => {}
                        Ok(false) => debug!(key = %full, "delete raced remote hit, not promoted"),
                        Err(reason) => debug!(key = %full, %reason, "remote hit not promoted"),
                    }
                }
                Ok(Some(data))
            }
            None => {
                debug!(key = %full, "cache miss");
                metrics::record_cache_miss();
                Ok(None)
            }
        }
    }

    /// Serialize `value` as JSON and store it in both tiers.
    ///
    /// A zero `ttl` means the TTL configured for the key's family, or the
    /// default TTL for keys outside the content families. TTLs above
    /// [`MAX_TTL`] are clamped to it.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> CacheResult<()> {
        let data = serde_json::to_vec(value)?;
        self.set_raw(key, Bytes::from(data), ttl).await
    }

    pub async fn set_raw(&self, key: &str, data: Bytes, ttl: Duration) -> CacheResult<()> {
        let full = self.full_key(key);
        let ttl = self.effective_ttl(key, ttl);

        if let Err(reason) = self.inner.local.insert(&full, data.clone(), ttl) {
            debug!(key = %full, %reason, "stored in remote tier only");
        }
        if let Err(err) = self
            .remote_call("set", self.inner.remote.set_ex(&full, data, ttl))
            .await
        {
            self.inner.local.remove(&full);
            return Err(err);
        }
        debug!(key = %full, ttl_ms = ttl.as_millis() as u64, "cache set (local+remote)");
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        let full = self.full_key(key);
        self.inner.local.remove(&full);
        let outcome = self
            .remote_call("delete", self.inner.remote.delete(&full))
            .await;
        self.fence(|local| {
            local.remove(&full);
        });
        outcome
    }

    /// Delete every key matching a Redis glob, in both tiers.
    ///
    /// The configured key prefix is matched literally. Returns how many
    /// remote keys were removed.
    pub async fn delete_by_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let full_pattern = format!("{}{}", pattern::escape(&self.inner.key_prefix), pattern);
        let swept = self.inner.local.remove_matching(&full_pattern);

        let outcome = self.delete_remote_matching(&full_pattern).await;
        self.fence(|local| {
            local.remove_matching(&full_pattern);
        });
        let removed = outcome?;
        debug!(pattern = %full_pattern, local = swept, remote = removed, "cache pattern deleted");
        Ok(removed)
    }

    async fn delete_remote_matching(&self, full_pattern: &str) -> CacheResult<usize> {
        let keys = self
            .remote_call("scan", self.inner.remote.scan(full_pattern))
            .await?;
        if !keys.is_empty() {
            self.remote_call("delete", self.inner.remote.delete_many(&keys))
                .await?;
        }
        Ok(keys.len())
    }

    /// Fetch several keys concurrently on the batch scheduler.
    ///
    /// The result at index `i` belongs to `keys[i]`. Dropping the returned
    /// future cancels the lookups still in flight.
    pub async fn multi_get<T, K>(&self, keys: &[K]) -> Vec<CacheResult<Option<T>>>
    where
        T: DeserializeOwned,
        K: AsRef<str>,
    {
        let raw = self.multi_get_raw(keys).await;
        raw.into_iter()
            .zip(keys)
            .map(|(result, key)| match result? {
                Some(data) => self.decode(key.as_ref(), &data).map(Some),
                None => Ok(None),
            })
            .collect()
    }

    pub async fn multi_get_raw<K: AsRef<str>>(&self, keys: &[K]) -> Vec<CacheResult<Option<Bytes>>> {
        let inputs: Vec<CacheResult<String>> =
            keys.iter().map(|k| Ok(k.as_ref().to_owned())).collect();
        self.run_batch("cache-multi-get", inputs, |cache, key: String| async move {
            cache.get_raw(&key).await
        })
        .await
    }

    /// Store several values concurrently. Per-entry results follow input
    /// order; a value that fails to serialize fails only its own slot.
    pub async fn multi_set<T, K>(&self, entries: &[(K, T)], ttl: Duration) -> Vec<CacheResult<()>>
    where
        T: Serialize,
        K: AsRef<str>,
    {
        let inputs: Vec<CacheResult<(String, Bytes)>> = entries
            .iter()
            .map(|(key, value)| {
                serde_json::to_vec(value)
                    .map(|data| (key.as_ref().to_owned(), Bytes::from(data)))
                    .map_err(CacheError::from)
            })
            .collect();
        self.run_batch(
            "cache-multi-set",
            inputs,
            move |cache, (key, data): (String, Bytes)| async move {
                cache.set_raw(&key, data, ttl).await
            },
        )
        .await
    }

    /// Delete several keys from both tiers in one remote round-trip.
    pub async fn multi_delete<K: AsRef<str>>(&self, keys: &[K]) -> CacheResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let full: Vec<String> = keys.iter().map(|k| self.full_key(k.as_ref())).collect();
        for key in &full {
            self.inner.local.remove(key);
        }
        let outcome = self
            .remote_call("delete", self.inner.remote.delete_many(&full))
            .await;
        self.fence(|local| {
            for key in &full {
                local.remove(key);
            }
        });
        outcome
    }

    /// Whether the remote tier answers a ping within the call timeout.
    pub async fn is_remote_available(&self) -> bool {
        self.remote_call("ping", self.inner.remote.ping())
            .await
            .is_ok()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_entries: self.inner.local.len(),
            remote_tier: self.inner.remote.name(),
        }
    }

    pub fn key_prefix(&self) -> &str {
        &self.inner.key_prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.inner.key_prefix, key)
    }

    fn effective_ttl(&self, key: &str, ttl: Duration) -> Duration {
        let ttl = if ttl.is_zero() {
            self.inner
                .family_ttls
                .get(&keys::family_of(key))
                .copied()
                .unwrap_or(self.inner.default_ttl)
        } else {
            ttl
        };
        ttl.min(MAX_TTL)
    }

    /// Stop in-flight reads from promoting, then clear what they may already
    /// have promoted. Runs after the remote half of a delete.
    fn fence(&self, clear: impl FnOnce(&LocalTier)) {
        self.inner.invalidations.fetch_add(1, Ordering::SeqCst);
        clear(&self.inner.local);
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, data: &[u8]) -> CacheResult<T> {
        serde_json::from_slice(data).map_err(|err| {
            warn!(key = %key, error = %err, "cached payload failed to decode");
            // Keep the bad copy from being served again from this instance.
            self.inner.local.remove(&self.full_key(key));
            CacheError::from(err)
        })
    }

    async fn remote_call<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = CacheResult<T>>,
    ) -> CacheResult<T> {
        match tokio::time::timeout(self.op_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                metrics::record_remote_error(op);
                warn!(op, error = %err, "remote cache call failed");
                Err(err)
            }
            Err(_) => {
                metrics::record_remote_error(op);
                warn!(op, timeout_ms = self.op_timeout.as_millis() as u64, "remote cache call timed out");
                Err(CacheError::Timeout {
                    op,
                    after: self.op_timeout,
                })
            }
        }
    }

    /// Run `op` for each ready input on the scheduler and collect results in
    /// input order. Inputs that are already errors pass straight through.
    async fn run_batch<I, R, F, Fut>(
        &self,
        name: &'static str,
        inputs: Vec<CacheResult<I>>,
        op: F,
    ) -> Vec<CacheResult<R>>
    where
        I: Send + 'static,
        R: Send + 'static,
        F: Fn(TieredCache, I) -> Fut,
        Fut: Future<Output = CacheResult<R>> + Send + 'static,
    {
        let batch = CancellationToken::new();
        let _cancel_on_drop = batch.clone().drop_guard();

        let mut slots = Vec::with_capacity(inputs.len());
        for input in inputs {
            let input = match input {
                Ok(input) => input,
                Err(err) => {
                    slots.push(Slot::Ready(Err(err)));
                    continue;
                }
            };

            let (tx, rx) = oneshot::channel();
            let work = op(self.clone(), input);
            let batch = batch.clone();
            let task = task_fn(name, move |cancel: CancellationToken| async move {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(CacheError::Cancelled),
                    _ = batch.cancelled() => Err(CacheError::Cancelled),
                    result = work => result,
                };
                let outcome = match &result {
                    Ok(_) => Ok(()),
                    Err(err) => Err(TaskError::failed(err)),
                };
                let _ = tx.send(result);
                outcome
            });

            slots.push(match self.scheduler.submit(task).await {
                Some(_) => Slot::Pending(rx),
                None => Slot::Ready(Err(CacheError::SchedulerUnavailable)),
            });
        }

        let mut results = Vec::with_capacity(slots.len());
        for slot in slots {
            results.push(match slot {
                Slot::Ready(result) => result,
                // The task was dropped unrun, e.g. by an aborted scheduler.
                Slot::Pending(rx) => rx.await.unwrap_or(Err(CacheError::Cancelled)),
            });
        }
        results
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("key_prefix", &self.inner.key_prefix)
            .field("local_entries", &self.inner.local.len())
            .field("remote", &self.inner.remote.name())
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryTier;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Novel {
        id: u64,
        title: String,
    }

    fn novel(id: u64) -> Novel {
        Novel {
            id,
            title: format!("Novel {id}"),
        }
    }

    fn scheduler() -> Arc<TaskScheduler> {
        let scheduler = TaskScheduler::new_shared(4);
        scheduler.start(&CancellationToken::new());
        scheduler
    }

    fn cache_over(remote: Arc<dyn RemoteTier>) -> TieredCache {
        TieredCache::new(remote, scheduler(), TieredCacheOptions::default())
    }

    fn memory_cache() -> (TieredCache, Arc<InMemoryTier>) {
        let remote = Arc::new(InMemoryTier::new());
        (cache_over(remote.clone()), remote)
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn set_then_get_round_trips_and_prefixes_keys() {
        let (cache, remote) = memory_cache();
        cache.set("novel:detail:1", &novel(1), MINUTE).await.unwrap();

        let got: Option<Novel> = cache.get("novel:detail:1").await.unwrap();
        assert_eq!(got, Some(novel(1)));

        let stored = remote.get("lightnovel:novel:detail:1").await.unwrap();
        assert!(stored.is_some());
        assert_eq!(cache.stats().local_entries, 1);
    }

    #[tokio::test]
    async fn absent_key_is_ok_none() {
        let (cache, _) = memory_cache();
        let got: Option<Novel> = cache.get("novel:detail:404").await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn remote_hit_is_promoted_with_remaining_ttl() {
        let (cache, remote) = memory_cache();
        let payload = serde_json::to_vec(&novel(7)).unwrap();
        remote
            .set_ex("lightnovel:novel:detail:7", Bytes::from(payload), MINUTE)
            .await
            .unwrap();
        assert_eq!(cache.stats().local_entries, 0);

        let got: Option<Novel> = cache.get("novel:detail:7").await.unwrap();
        assert_eq!(got, Some(novel(7)));
        assert_eq!(cache.stats().local_entries, 1);

        // Served locally from here on, even with the remote gone.
        remote.set_available(false);
        let again: Option<Novel> = cache.get("novel:detail:7").await.unwrap();
        assert_eq!(again, Some(novel(7)));
    }

    #[tokio::test]
    async fn delete_clears_both_tiers() {
        let (cache, remote) = memory_cache();
        cache.set("k", &1u32, MINUTE).await.unwrap();
        cache.delete("k").await.unwrap();

        assert_eq!(cache.get::<u32>("k").await.unwrap(), None);
        assert!(remote.is_empty());
        assert_eq!(cache.stats().local_entries, 0);
    }

    #[tokio::test]
    async fn failed_remote_set_is_reported_and_rolled_back() {
        let (cache, remote) = memory_cache();
        remote.set_available(false);

        let err = cache.set("k", &1u32, MINUTE).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(cache.stats().local_entries, 0);

        remote.set_available(true);
        assert_eq!(cache.get::<u32>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn remote_read_failure_surfaces_instead_of_miss() {
        let (cache, remote) = memory_cache();
        remote.set_available(false);
        let err = cache.get::<u32>("k").await.unwrap_err();
        assert!(matches!(err, CacheError::TransientRemote { op: "get", .. }));
        assert!(!cache.is_remote_available().await);
    }

    #[tokio::test]
    async fn undecodable_payload_is_serialization_error() {
        let (cache, _) = memory_cache();
        cache
            .set_raw("k", Bytes::from_static(b"not json"), MINUTE)
            .await
            .unwrap();
        let err = cache.get::<Novel>("k").await.unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
        assert_eq!(cache.stats().local_entries, 0);
    }

    #[tokio::test]
    async fn zero_ttl_uses_default() {
        let (cache, remote) = memory_cache();
        cache.set("k", &1u32, Duration::ZERO).await.unwrap();
        let stored = remote.get("lightnovel:k").await.unwrap().unwrap();
        assert!(stored.ttl.is_some_and(|t| t > Duration::from_secs(590)));
    }

    #[tokio::test]
    async fn zero_ttl_uses_family_ttl_for_content_keys() {
        let (cache, remote) = memory_cache();
        cache
            .set(&keys::chapter("42", 1, 1), &"text", Duration::ZERO)
            .await
            .unwrap();
        let stored = remote
            .get("lightnovel:novel:chapter:42:1:1")
            .await
            .unwrap()
            .unwrap();
        // chapter_detail_secs defaults to an hour.
        assert!(stored.ttl.is_some_and(|t| t > Duration::from_secs(3500)));
    }

    #[tokio::test]
    async fn delete_by_pattern_sweeps_family_only() {
        let (cache, remote) = memory_cache();
        for (vol, ch) in [(1, 1), (1, 2), (2, 1)] {
            cache
                .set(&format!("novel:chapter:42:{vol}:{ch}"), &ch, MINUTE)
                .await
                .unwrap();
        }
        cache.set("novel:detail:42", &novel(42), MINUTE).await.unwrap();

        let removed = cache.delete_by_pattern("novel:chapter:42*").await.unwrap();
        assert_eq!(removed, 3);

        for (vol, ch) in [(1, 1), (1, 2), (2, 1)] {
            let key = format!("novel:chapter:42:{vol}:{ch}");
            assert_eq!(cache.get::<u32>(&key).await.unwrap(), None);
        }
        assert_eq!(
            cache.get::<Novel>("novel:detail:42").await.unwrap(),
            Some(novel(42))
        );
        assert_eq!(remote.len(), 1);
    }

    #[tokio::test]
    async fn detail_set_then_pattern_delete() {
        let (cache, _) = memory_cache();
        cache
            .set("novel:detail:42", &novel(42), Duration::from_secs(1800))
            .await
            .unwrap();
        assert_eq!(cache.get::<Novel>("novel:detail:42").await.unwrap(), Some(novel(42)));

        assert_eq!(cache.delete_by_pattern("novel:detail:42*").await.unwrap(), 1);
        assert_eq!(cache.get::<Novel>("novel:detail:42").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_by_pattern_with_no_matches_is_zero() {
        let (cache, _) = memory_cache();
        assert_eq!(cache.delete_by_pattern("novel:chapter:9:*").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn multi_get_keeps_input_order() {
        // Earlier keys answer later, so completion order is the reverse of
        // input order.
        let remote = Arc::new(Delayed {
            inner: InMemoryTier::new(),
            delays: HashMap::from([
                ("lightnovel:a".to_string(), Duration::from_millis(300)),
                ("lightnovel:b".to_string(), Duration::from_millis(200)),
                ("lightnovel:c".to_string(), Duration::from_millis(100)),
            ]),
            finished: Mutex::new(Vec::new()),
        });
        for (key, id) in [("lightnovel:a", 1), ("lightnovel:c", 3)] {
            let payload = serde_json::to_vec(&novel(id)).unwrap();
            remote.inner.set_ex(key, Bytes::from(payload), MINUTE).await.unwrap();
        }
        let cache = cache_over(remote.clone());

        let results: Vec<CacheResult<Option<Novel>>> = cache.multi_get(&["a", "b", "c"]).await;
        assert_eq!(
            *remote.finished.lock().unwrap(),
            vec!["lightnovel:c", "lightnovel:b", "lightnovel:a"]
        );
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &Some(novel(1)));
        assert_eq!(results[1].as_ref().unwrap(), &None);
        assert_eq!(results[2].as_ref().unwrap(), &Some(novel(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn set_writes_both_tiers_with_same_ttl() {
        let (cache, remote) = memory_cache();
        cache.set("k", &1u32, Duration::from_secs(90)).await.unwrap();

        let stored = remote.get("lightnovel:k").await.unwrap().unwrap();
        assert_eq!(stored.ttl, Some(Duration::from_secs(90)));
        assert_eq!(
            cache.inner.local.remaining("lightnovel:k"),
            Some(Duration::from_secs(90))
        );
    }

    #[tokio::test]
    async fn huge_ttl_is_clamped_not_fatal() {
        let (cache, remote) = memory_cache();
        cache
            .set("k", &1u32, Duration::from_secs(u64::MAX))
            .await
            .unwrap();

        assert_eq!(cache.get::<u32>("k").await.unwrap(), Some(1));
        let stored = remote.get("lightnovel:k").await.unwrap().unwrap();
        assert!(stored.ttl.is_some_and(|t| t <= MAX_TTL));
        assert!(
            cache
                .inner
                .local
                .remaining("lightnovel:k")
                .is_some_and(|t| t <= MAX_TTL)
        );
    }

    #[tokio::test]
    async fn pattern_delete_treats_prefix_literally() {
        let remote = Arc::new(InMemoryTier::new());
        let options = TieredCacheOptions {
            key_prefix: "ln*:".to_string(),
            ..TieredCacheOptions::default()
        };
        let cache = TieredCache::new(remote.clone(), scheduler(), options);
        cache.set("novel:detail:1", &novel(1), MINUTE).await.unwrap();
        // Another namespace the unescaped `*` would have matched.
        remote
            .set_ex("lnX:novel:detail:1", Bytes::from_static(b"1"), MINUTE)
            .await
            .unwrap();

        assert_eq!(cache.delete_by_pattern("novel:detail:*").await.unwrap(), 1);
        assert!(remote.get("lnX:novel:detail:1").await.unwrap().is_some());
        assert_eq!(remote.len(), 1);
    }

    /// Delete `key` while a read of it has fetched the old remote value but
    /// not yet promoted it, then check nothing was resurrected.
    async fn delete_during_in_flight_read<F, Fut>(key: &str, delete: F)
    where
        F: FnOnce(TieredCache) -> Fut,
        Fut: Future<Output = ()>,
    {
        let remote = Arc::new(GatedRead::new());
        remote
            .inner
            .set_ex(&format!("lightnovel:{key}"), Bytes::from_static(b"1"), MINUTE)
            .await
            .unwrap();
        let cache = cache_over(remote.clone());

        let reader = {
            let cache = cache.clone();
            let key = key.to_owned();
            tokio::spawn(async move { cache.get_raw(&key).await })
        };
        remote.fetched.notified().await;

        delete(cache.clone()).await;
        remote.release.notify_one();
        // The racing read began before the delete and may still see the old value.
        reader.await.unwrap().unwrap();

        assert_eq!(cache.get_raw(key).await.unwrap(), None);
        assert_eq!(cache.stats().local_entries, 0);
    }

    #[tokio::test]
    async fn delete_wins_over_in_flight_read() {
        delete_during_in_flight_read("novel:detail:42", |cache| async move {
            cache.delete("novel:detail:42").await.unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn pattern_delete_wins_over_in_flight_read() {
        delete_during_in_flight_read("novel:chapter:42:1:1", |cache| async move {
            assert_eq!(cache.delete_by_pattern("novel:chapter:42:*").await.unwrap(), 1);
        })
        .await;
    }

    #[tokio::test]
    async fn multi_delete_wins_over_in_flight_read() {
        delete_during_in_flight_read("novel:volumes:42", |cache| async move {
            cache.multi_delete(&["novel:volumes:42"]).await.unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn multi_set_then_multi_delete() {
        let (cache, remote) = memory_cache();
        let entries = vec![
            ("n:1".to_string(), novel(1)),
            ("n:2".to_string(), novel(2)),
            ("n:3".to_string(), novel(3)),
        ];
        let results = cache.multi_set(&entries, MINUTE).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(remote.len(), 3);

        cache.multi_delete(&["n:1", "n:3"]).await.unwrap();
        let results: Vec<CacheResult<Option<Novel>>> =
            cache.multi_get(&["n:1", "n:2", "n:3"]).await;
        assert_eq!(results[0].as_ref().unwrap(), &None);
        assert_eq!(results[1].as_ref().unwrap(), &Some(novel(2)));
        assert_eq!(results[2].as_ref().unwrap(), &None);
    }

    #[tokio::test]
    async fn multi_get_reports_per_key_errors() {
        let (cache, _) = memory_cache();
        cache.set("good", &novel(1), MINUTE).await.unwrap();
        cache
            .set_raw("bad", Bytes::from_static(b"{broken"), MINUTE)
            .await
            .unwrap();

        let results: Vec<CacheResult<Option<Novel>>> = cache.multi_get(&["good", "bad"]).await;
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(CacheError::Serialization(_))));
    }

    #[tokio::test]
    async fn multi_get_after_scheduler_stop_is_unavailable() {
        let remote = Arc::new(InMemoryTier::new());
        let scheduler = scheduler();
        let cache = TieredCache::new(remote, scheduler.clone(), TieredCacheOptions::default());
        scheduler.stop().await;

        let results: Vec<CacheResult<Option<u32>>> = cache.multi_get(&["a", "b"]).await;
        assert!(
            results
                .iter()
                .all(|r| matches!(r, Err(CacheError::SchedulerUnavailable)))
        );
    }

    /// In-memory tier whose reads finish after a per-key delay.
    struct Delayed {
        inner: InMemoryTier,
        delays: HashMap<String, Duration>,
        finished: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteTier for Delayed {
        fn name(&self) -> &'static str {
            "delayed"
        }
        async fn get(&self, key: &str) -> CacheResult<Option<RemoteValue>> {
            if let Some(delay) = self.delays.get(key) {
                tokio::time::sleep(*delay).await;
            }
            self.finished.lock().unwrap().push(key.to_owned());
            self.inner.get(key).await
        }
        async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
            self.inner.set_ex(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> CacheResult<()> {
            self.inner.delete(key).await
        }
        async fn delete_many(&self, keys: &[String]) -> CacheResult<()> {
            self.inner.delete_many(keys).await
        }
        async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>> {
            self.inner.scan(pattern).await
        }
        async fn ping(&self) -> CacheResult<()> {
            self.inner.ping().await
        }
    }

    /// In-memory tier whose first read fetches its value, signals
    /// `fetched`, and holds the value back until `release`.
    struct GatedRead {
        inner: InMemoryTier,
        armed: AtomicBool,
        fetched: Notify,
        release: Notify,
    }

    impl GatedRead {
        fn new() -> Self {
            Self {
                inner: InMemoryTier::new(),
                armed: AtomicBool::new(true),
                fetched: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl RemoteTier for GatedRead {
        fn name(&self) -> &'static str {
            "gated"
        }
        async fn get(&self, key: &str) -> CacheResult<Option<RemoteValue>> {
            let value = self.inner.get(key).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.fetched.notify_one();
                self.release.notified().await;
            }
            Ok(value)
        }
        async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
            self.inner.set_ex(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> CacheResult<()> {
            self.inner.delete(key).await
        }
        async fn delete_many(&self, keys: &[String]) -> CacheResult<()> {
            self.inner.delete_many(keys).await
        }
        async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>> {
            self.inner.scan(pattern).await
        }
        async fn ping(&self) -> CacheResult<()> {
            self.inner.ping().await
        }
    }

    /// Remote tier whose reads never complete.
    struct Stalled {
        started: AtomicUsize,
    }

    #[async_trait]
    impl RemoteTier for Stalled {
        fn name(&self) -> &'static str {
            "stalled"
        }
        async fn get(&self, _key: &str) -> CacheResult<Option<RemoteValue>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
        async fn set_ex(&self, _: &str, _: Bytes, _: Duration) -> CacheResult<()> {
            std::future::pending().await
        }
        async fn delete(&self, _: &str) -> CacheResult<()> {
            Ok(())
        }
        async fn delete_many(&self, _: &[String]) -> CacheResult<()> {
            Ok(())
        }
        async fn scan(&self, _: &str) -> CacheResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn ping(&self) -> CacheResult<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_remote_times_out() {
        let cache = cache_over(Arc::new(Stalled {
            started: AtomicUsize::new(0),
        }))
        .with_deadline(Duration::from_millis(50));

        let err = cache.get::<u32>("k").await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout { op: "get", .. }));
        assert!(!cache.is_remote_available().await);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_multi_get_cancels_in_flight_lookups() {
        let remote = Arc::new(Stalled {
            started: AtomicUsize::new(0),
        });
        let scheduler = scheduler();
        let cache = TieredCache::new(remote.clone(), scheduler.clone(), TieredCacheOptions::default())
            .with_deadline(Duration::from_secs(3600));

        let keys = ["a", "b", "c"];
        let lookup = cache.multi_get::<u32, _>(&keys);
        let outcome = tokio::time::timeout(Duration::from_millis(10), lookup).await;
        assert!(outcome.is_err());

        // Cancelled tasks free the workers, so stop drains promptly.
        tokio::time::timeout(Duration::from_secs(1), scheduler.stop())
            .await
            .expect("workers released after cancellation");
        assert_eq!(scheduler.stats().failed, 3);
    }
}
