//! Key builders for the cached content families.
//!
//! Keys are relative; the cache adds its configured prefix. Family patterns
//! end in `:*` so invalidating novel `4` never touches novel `42`.

use super::pattern::escape;

pub const NOVEL_LIST: &str = "novel:list";
pub const NOVEL_DETAIL: &str = "novel:detail";
pub const VOLUME_LIST: &str = "novel:volumes";
pub const CHAPTER_LIST: &str = "novel:chapters";
pub const CHAPTER: &str = "novel:chapter";
pub const SEARCH: &str = "novel:search";
pub const LATEST: &str = "novel:latest";
pub const POPULAR: &str = "novel:popular";

pub const READING_HISTORY: &str = "user:history";
pub const READING_PROGRESS: &str = "user:progress";
pub const BOOKMARKS: &str = "user:bookmarks";
pub const FAVORITES: &str = "user:favorites";

/// Which TTL bucket a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFamily {
    NovelList,
    NovelDetail,
    VolumeList,
    ChapterList,
    ChapterDetail,
    SearchResult,
    LatestNovels,
    PopularNovels,
    UserState,
}

pub fn novel_list_page(page: u32, size: u32) -> String {
    format!("{NOVEL_LIST}:{page}:{size}")
}

pub fn novel_list_count() -> String {
    format!("{NOVEL_LIST}:count")
}

pub fn novel_detail(novel_id: &str) -> String {
    format!("{NOVEL_DETAIL}:{novel_id}")
}

pub fn volume_list(novel_id: &str) -> String {
    format!("{VOLUME_LIST}:{novel_id}")
}

pub fn chapter_list(novel_id: &str, volume: u32) -> String {
    format!("{CHAPTER_LIST}:{novel_id}:{volume}")
}

pub fn chapter(novel_id: &str, volume: u32, chapter: u32) -> String {
    format!("{CHAPTER}:{novel_id}:{volume}:{chapter}")
}

pub fn search(keyword: &str, page: u32, size: u32) -> String {
    format!("{SEARCH}:{keyword}:{page}:{size}")
}

pub fn latest(limit: u32) -> String {
    format!("{LATEST}:{limit}")
}

pub fn popular(limit: u32) -> String {
    format!("{POPULAR}:{limit}")
}

pub fn reading_history(device_id: &str) -> String {
    format!("{READING_HISTORY}:{device_id}")
}

pub fn reading_progress(device_id: &str, novel_id: &str) -> String {
    format!("{READING_PROGRESS}:{device_id}:{novel_id}")
}

pub fn bookmarks(device_id: &str) -> String {
    format!("{BOOKMARKS}:{device_id}")
}

pub fn favorites(device_id: &str) -> String {
    format!("{FAVORITES}:{device_id}")
}

/// Every list page and the list count.
pub fn novel_list_family() -> String {
    format!("{NOVEL_LIST}:*")
}

pub fn chapter_family(novel_id: &str) -> String {
    format!("{CHAPTER}:{}:*", escape(novel_id))
}

pub fn chapter_list_family(novel_id: &str) -> String {
    format!("{CHAPTER_LIST}:{}:*", escape(novel_id))
}

pub fn latest_family() -> String {
    format!("{LATEST}:*")
}

pub fn popular_family() -> String {
    format!("{POPULAR}:*")
}

/// Every cached search page for `keyword`, with glob characters escaped.
pub fn search_family(keyword: &str) -> String {
    format!("{SEARCH}:{}:*", escape(keyword))
}

pub fn reading_progress_family(device_id: &str) -> String {
    format!("{READING_PROGRESS}:{}:*", escape(device_id))
}

/// Classify a relative key by its family prefix.
pub fn family_of(key: &str) -> KeyFamily {
    let families = [
        (CHAPTER_LIST, KeyFamily::ChapterList),
        (CHAPTER, KeyFamily::ChapterDetail),
        (VOLUME_LIST, KeyFamily::VolumeList),
        (NOVEL_LIST, KeyFamily::NovelList),
        (NOVEL_DETAIL, KeyFamily::NovelDetail),
        (SEARCH, KeyFamily::SearchResult),
        (LATEST, KeyFamily::LatestNovels),
        (POPULAR, KeyFamily::PopularNovels),
    ];
    families
        .iter()
        .find(|(prefix, _)| {
            key.strip_prefix(*prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(':'))
        })
        .map(|(_, family)| *family)
        .unwrap_or(KeyFamily::UserState)
}
