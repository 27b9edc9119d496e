//! In-process tier backed by a sharded `DashMap`.

use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

use super::pattern::glob_match;

/// Expiry used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Absolute expiry for `ttl` from now, saturating instead of overflowing.
pub(crate) fn expiry_after(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
}

/// A cached payload with an absolute expiry.
///
/// `Bytes` keeps hits cheap to clone regardless of payload size.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Bytes,
    pub expires_at: Instant,
}

impl CachedEntry {
    pub fn new(data: Bytes, ttl: Duration) -> Self {
        Self {
            data,
            expires_at: expiry_after(ttl),
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Why a write was not admitted to the local tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    TooLarge { size: usize, limit: usize },
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge { size, limit } => {
                write!(f, "entry of {size} bytes exceeds local limit of {limit}")
            }
        }
    }
}

/// Bounded, expiring key/value store.
///
/// When full, expired entries are purged first; if that frees nothing the
/// entry closest to expiry is dropped.
#[derive(Debug)]
pub struct LocalTier {
    map: DashMap<String, CachedEntry>,
    max_entries: usize,
    max_entry_bytes: usize,
}

impl LocalTier {
    pub fn new(max_entries: usize, max_entry_bytes: usize) -> Self {
        Self {
            map: DashMap::new(),
            max_entries: max_entries.max(1),
            max_entry_bytes,
        }
    }

    /// Fresh payload for `key`, lazily dropping it if it has expired.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let entry = self.map.get(key).map(|e| e.value().clone())?;
        if entry.is_expired() {
            // Only drop what we saw; a concurrent fresh write must survive.
            self.map.remove_if(key, |_, e| e.is_expired());
            return None;
        }
        Some(entry.data)
    }

    pub fn insert(&self, key: &str, data: Bytes, ttl: Duration) -> Result<(), Rejected> {
        if data.len() > self.max_entry_bytes {
            self.map.remove(key);
            return Err(Rejected::TooLarge {
                size: data.len(),
                limit: self.max_entry_bytes,
            });
        }
        if !self.map.contains_key(key) && self.map.len() >= self.max_entries {
            self.make_room();
        }
        self.map.insert(key.to_owned(), CachedEntry::new(data, ttl));
        crate::metrics::set_local_entries(self.map.len());
        Ok(())
    }

    /// Insert only if `admit` still holds once the key's shard is locked.
    ///
    /// A `remove` of the same key either runs before the check, so `admit`
    /// can see whatever the remover changed first, or waits for the insert
    /// to finish and then removes it. Returns `Ok(false)` when `admit`
    /// refused.
    pub fn insert_if(
        &self,
        key: &str,
        data: Bytes,
        ttl: Duration,
        admit: impl FnOnce() -> bool,
    ) -> Result<bool, Rejected> {
        if data.len() > self.max_entry_bytes {
            return Err(Rejected::TooLarge {
                size: data.len(),
                limit: self.max_entry_bytes,
            });
        }
        // Must run before the entry lock is taken: it walks every shard.
        if !self.map.contains_key(key) && self.map.len() >= self.max_entries {
            self.make_room();
        }
        {
            let entry = self.map.entry(key.to_owned());
            if !admit() {
                return Ok(false);
            }
            entry.insert(CachedEntry::new(data, ttl));
        }
        crate::metrics::set_local_entries(self.map.len());
        Ok(true)
    }

    /// Time left on a fresh entry.
    pub fn remaining(&self, key: &str) -> Option<Duration> {
        self.map
            .get(key)
            .filter(|e| !e.value().is_expired())
            .map(|e| e.value().remaining())
    }

    pub fn remove(&self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    /// Remove every key matching the Redis glob `pattern`.
    pub fn remove_matching(&self, pattern: &str) -> usize {
        let before = self.map.len();
        self.map.retain(|key, _| !glob_match(pattern, key));
        let removed = before.saturating_sub(self.map.len());
        crate::metrics::set_local_entries(self.map.len());
        removed
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    fn make_room(&self) {
        self.map.retain(|_, entry| !entry.is_expired());
        if self.map.len() < self.max_entries {
            return;
        }
        let victim = self
            .map
            .iter()
            .min_by_key(|e| e.value().expires_at)
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            self.map.remove(&key);
        }
    }
}
