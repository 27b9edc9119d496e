//! Cache invalidation tied to content changes.

use super::error::CacheResult;
use super::keys;
use super::tiered::TieredCache;
use crate::realtime::{Notifier, NovelUpdate, UpdateKind};

/// Clears the cache families a content change makes stale and tells
/// connected readers about it.
#[derive(Clone, Debug)]
pub struct ContentInvalidator {
    cache: TieredCache,
    notifier: Notifier,
}

impl ContentInvalidator {
    pub fn new(cache: TieredCache, notifier: Notifier) -> Self {
        Self { cache, notifier }
    }

    /// A novel changed: drop its detail, chapters, and every list it may
    /// appear in, then broadcast the update.
    ///
    /// Readers are only notified once invalidation succeeded, so nobody is
    /// told to refetch while stale entries are still being served.
    pub async fn novel_updated(&self, novel_id: &str, title: &str, kind: UpdateKind) -> CacheResult<()> {
        self.cache
            .multi_delete(&[keys::novel_detail(novel_id), keys::volume_list(novel_id)])
            .await?;
        for pattern in [
            keys::novel_list_family(),
            keys::latest_family(),
            keys::popular_family(),
            keys::chapter_family(novel_id),
            keys::chapter_list_family(novel_id),
        ] {
            self.cache.delete_by_pattern(&pattern).await?;
        }

        let update = NovelUpdate::new(novel_id, title, kind);
        if let Err(err) = self.notifier.novel_update(update) {
            tracing::warn!(novel_id, error = %err, "novel update not broadcast");
        }
        Ok(())
    }

    /// A reader's progress changed: drop their history and progress entries.
    pub async fn reading_progress_changed(&self, device_id: &str, novel_id: &str) -> CacheResult<()> {
        self.cache
            .multi_delete(&[
                keys::reading_history(device_id),
                keys::reading_progress(device_id, novel_id),
            ])
            .await
    }

    /// Drop everything cached for a device.
    pub async fn device_forgotten(&self, device_id: &str) -> CacheResult<()> {
        self.cache
            .multi_delete(&[
                keys::reading_history(device_id),
                keys::bookmarks(device_id),
                keys::favorites(device_id),
            ])
            .await?;
        self.cache
            .delete_by_pattern(&keys::reading_progress_family(device_id))
            .await
            .map(|_| ())
    }
}
