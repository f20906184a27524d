//! Items, settings and results shared by every feed.
use crate::error::{FeedError, FeedErrorKind};
use crate::feed::FeedKind;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use url::Url;

// ============================================================================
// NormalizedItem
// ============================================================================

/// One map entry, independent of the feed it came from.
///
/// The hash is stored upper case and the key lower case so entries from
/// different services compare equal. Values are never mutated after
/// construction; the `with_*` methods consume and return a new item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedItem {
    hash: String,
    key: String,
    name: String,
    level_author: String,
    download_uri: Option<Url>,
    source_uri: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw: Option<String>,
}

impl NormalizedItem {
    pub fn new(
        hash: impl AsRef<str>,
        key: impl AsRef<str>,
        name: impl Into<String>,
        level_author: impl Into<String>,
    ) -> Self {
        Self {
            hash: hash.as_ref().trim().to_uppercase(),
            key: key.as_ref().trim().to_lowercase(),
            name: name.into(),
            level_author: level_author.into(),
            download_uri: None,
            source_uri: None,
            raw: None,
        }
    }

    pub fn with_download_uri(self, uri: Option<Url>) -> Self {
        Self {
            download_uri: uri,
            ..self
        }
    }

    pub fn with_source_uri(self, uri: Option<Url>) -> Self {
        Self {
            source_uri: uri,
            ..self
        }
    }

    pub fn with_raw(self, raw: Option<String>) -> Self {
        Self { raw, ..self }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level_author(&self) -> &str {
        &self.level_author
    }

    pub fn download_uri(&self) -> Option<&Url> {
        self.download_uri.as_ref()
    }

    pub fn source_uri(&self) -> Option<&Url> {
        self.source_uri.as_ref()
    }

    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    /// Key used to de-duplicate entries: the hash, or the key when the source
    /// does not publish hashes. `None` for entries that carry neither.
    pub fn identity(&self) -> Option<&str> {
        if !self.hash.is_empty() {
            Some(&self.hash)
        } else if !self.key.is_empty() {
            Some(&self.key)
        } else {
            None
        }
    }
}

// ============================================================================
// FeedSettings
// ============================================================================

/// What a feed kind filters on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCriterion {
    /// Free-text search query
    Query(String),
    /// Mapper id (BeatSaver) or user name (BeastSaber)
    Author(String),
}

/// Predicate returning `true` for items that must be left out of the result.
pub type ItemFilter = Arc<dyn Fn(&NormalizedItem) -> bool + Send + Sync>;

/// Parameters for one pagination run. Read-only while the run is active.
#[derive(Clone)]
pub struct FeedSettings {
    pub kind: FeedKind,
    /// Maximum number of items to return (0 = unlimited)
    pub max_songs: usize,
    /// Maximum number of pages to visit (0 = unlimited)
    pub max_pages: usize,
    /// Items per page requested from services that accept a page size
    pub songs_per_page: usize,
    /// First page index visited
    pub starting_page: usize,
    pub criterion: Option<FeedCriterion>,
    pub exclude: Option<ItemFilter>,
    /// Maximum simultaneous page fetches (0 is treated as 1)
    pub concurrency: usize,
    /// Keep each item's raw payload
    pub store_raw: bool,
}

impl FeedSettings {
    pub const DEFAULT_SONGS_PER_PAGE: usize = 20;
    pub const DEFAULT_CONCURRENCY: usize = 4;

    pub fn new(kind: FeedKind) -> Self {
        Self {
            kind,
            max_songs: 0,
            max_pages: 0,
            songs_per_page: Self::DEFAULT_SONGS_PER_PAGE,
            starting_page: 0,
            criterion: None,
            exclude: None,
            concurrency: Self::DEFAULT_CONCURRENCY,
            store_raw: false,
        }
    }

    pub fn with_max_songs(mut self, max_songs: usize) -> Self {
        self.max_songs = max_songs;
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_songs_per_page(mut self, songs_per_page: usize) -> Self {
        self.songs_per_page = songs_per_page;
        self
    }

    pub fn with_starting_page(mut self, starting_page: usize) -> Self {
        self.starting_page = starting_page;
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.criterion = Some(FeedCriterion::Query(query.into()));
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.criterion = Some(FeedCriterion::Author(author.into()));
        self
    }

    pub fn with_exclude<F>(mut self, filter: F) -> Self
    where
        F: Fn(&NormalizedItem) -> bool + Send + Sync + 'static,
    {
        self.exclude = Some(Arc::new(filter));
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_store_raw(mut self, store_raw: bool) -> Self {
        self.store_raw = store_raw;
        self
    }

    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    /// Non-empty search text, if the criterion is a query.
    pub fn query(&self) -> Option<&str> {
        match &self.criterion {
            Some(FeedCriterion::Query(q)) if !q.trim().is_empty() => Some(q.trim()),
            _ => None,
        }
    }

    /// Non-empty author identifier, if the criterion is an author.
    pub fn author(&self) -> Option<&str> {
        match &self.criterion {
            Some(FeedCriterion::Author(a)) if !a.trim().is_empty() => Some(a.trim()),
            _ => None,
        }
    }
}

impl fmt::Debug for FeedSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedSettings")
            .field("kind", &self.kind)
            .field("max_songs", &self.max_songs)
            .field("max_pages", &self.max_pages)
            .field("songs_per_page", &self.songs_per_page)
            .field("starting_page", &self.starting_page)
            .field("criterion", &self.criterion)
            .field("exclude", &self.exclude.as_ref().map(|_| "<filter>"))
            .field("concurrency", &self.concurrency)
            .field("store_raw", &self.store_raw)
            .finish()
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of fetching and parsing one page.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub source: Url,
    pub items: Vec<NormalizedItem>,
    pub index: usize,
    pub fault: Option<FeedError>,
}

impl PageResult {
    pub fn new(source: Url, index: usize, items: Vec<NormalizedItem>) -> Self {
        Self {
            source,
            items,
            index,
            fault: None,
        }
    }

    pub fn faulted(source: Url, index: usize, fault: FeedError) -> Self {
        Self {
            source,
            items: Vec::new(),
            index,
            fault: Some(fault),
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }
}

/// Lifecycle of one feed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriverState {
    Idle,
    Validating,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl DriverState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DriverState::Completed | DriverState::Cancelled | DriverState::Failed
        )
    }
}

/// Terminal aggregate of a feed run.
#[derive(Debug, Clone)]
pub struct FeedResult {
    pub success: bool,
    pub error: Option<FeedError>,
    /// Items keyed by [`NormalizedItem::identity`], in first-seen order
    pub songs: IndexMap<String, NormalizedItem>,
    /// Every page visited, including a faulted one
    pub page_results: Vec<PageResult>,
    /// Non-faulted pages merged into `songs`
    pub pages_checked: usize,
    pub state: DriverState,
}

impl FeedResult {
    /// Result of a run rejected before any page was requested.
    pub fn rejected(error: FeedError) -> Self {
        let state = match error {
            FeedError::Cancelled => DriverState::Cancelled,
            _ => DriverState::Failed,
        };
        Self {
            success: false,
            error: Some(error),
            songs: IndexMap::new(),
            page_results: Vec::new(),
            pages_checked: 0,
            state,
        }
    }

    pub fn error_kind(&self) -> Option<FeedErrorKind> {
        self.error.as_ref().map(FeedError::kind)
    }

    pub fn items(&self) -> impl Iterator<Item = &NormalizedItem> {
        self.songs.values()
    }
}

/// Combines several results into one map, first-seen wins across results.
///
/// The merged result is successful only if every input was.
pub fn merge_results<I>(results: I) -> FeedResult
where
    I: IntoIterator<Item = FeedResult>,
{
    let mut merged = FeedResult {
        success: true,
        error: None,
        songs: IndexMap::new(),
        page_results: Vec::new(),
        pages_checked: 0,
        state: DriverState::Completed,
    };

    for result in results {
        if !result.success {
            merged.success = false;
            if merged.error.is_none() {
                merged.error = result.error;
                merged.state = result.state;
            }
        }
        for (id, item) in result.songs {
            merged.songs.entry(id).or_insert(item);
        }
        merged.page_results.extend(result.page_results);
        merged.pages_checked += result.pages_checked;
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_normalizes_case() {
        let item = NormalizedItem::new(" abcDEF123 ", "1A2B", "Song", "Mapper");
        assert_eq!(item.hash(), "ABCDEF123");
        assert_eq!(item.key(), "1a2b");
        assert_eq!(item.identity(), Some("ABCDEF123"));
    }

    #[test]
    fn test_identity_falls_back_to_key() {
        let item = NormalizedItem::new("", "FF01", "Song", "Mapper");
        assert_eq!(item.identity(), Some("ff01"));

        let empty = NormalizedItem::new("  ", "", "Song", "Mapper");
        assert_eq!(empty.identity(), None);
    }

    #[test]
    fn test_with_methods_replace_fields() {
        let url = Url::parse("https://example.com/map/1").unwrap();
        let item = NormalizedItem::new("aa", "1", "Song", "Mapper")
            .with_source_uri(Some(url.clone()))
            .with_raw(Some("{}".to_string()));
        assert_eq!(item.source_uri(), Some(&url));
        assert_eq!(item.raw(), Some("{}"));
        assert!(item.download_uri().is_none());
    }

    #[test]
    fn test_settings_criterion_accessors() {
        let s = FeedSettings::new(FeedKind::BeatSaverSearch).with_query("  ");
        assert_eq!(s.query(), None);

        let s = FeedSettings::new(FeedKind::BeatSaverSearch).with_query(" camellia ");
        assert_eq!(s.query(), Some("camellia"));
        assert_eq!(s.author(), None);

        let s = FeedSettings::new(FeedKind::BeatSaverMapper).with_author("4284");
        assert_eq!(s.author(), Some("4284"));
    }

    #[test]
    fn test_zero_concurrency_is_one() {
        let s = FeedSettings::new(FeedKind::BeatSaverLatest).with_concurrency(0);
        assert_eq!(s.effective_concurrency(), 1);
    }

    #[test]
    fn test_debug_hides_filter() {
        let s = FeedSettings::new(FeedKind::BeatSaverLatest).with_exclude(|_| true);
        let out = format!("{:?}", s);
        assert!(out.contains("<filter>"));
    }

    #[test]
    fn test_merge_results_first_seen_wins() {
        let mut a = FeedResult::rejected(FeedError::Cancelled);
        a.songs.insert(
            "AA".into(),
            NormalizedItem::new("aa", "1", "First", "x"),
        );
        a.pages_checked = 1;
        let mut b = FeedResult {
            success: true,
            error: None,
            songs: IndexMap::new(),
            page_results: Vec::new(),
            pages_checked: 2,
            state: DriverState::Completed,
        };
        b.songs
            .insert("AA".into(), NormalizedItem::new("aa", "1", "Second", "x"));
        b.songs
            .insert("BB".into(), NormalizedItem::new("bb", "2", "Other", "x"));

        let merged = merge_results(vec![a, b]);
        assert!(!merged.success);
        assert_eq!(merged.error, Some(FeedError::Cancelled));
        assert_eq!(merged.songs.len(), 2);
        assert_eq!(merged.songs["AA"].name(), "First");
        assert_eq!(merged.pages_checked, 3);
    }
}
