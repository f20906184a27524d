//! Folds page results into the ordered, de-duplicated item map of a run.
use crate::error::FeedError;
use crate::feed::{DriverState, FeedResult, FeedSettings, ItemFilter, NormalizedItem, PageResult};
use indexmap::IndexMap;

/// What merging one page changed, and whether the run should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    /// Items inserted into the map
    pub added: usize,
    /// The map holds `max_songs` items
    pub limit_reached: bool,
    /// The page listed no items at all
    pub end_of_data: bool,
}

impl MergeOutcome {
    pub fn should_stop(&self) -> bool {
        self.limit_reached || self.end_of_data
    }
}

/// Accumulates the items of one feed run.
///
/// The first occurrence of an identity wins. Excluded items and items without
/// an identity never enter the map, so they never count against `max_songs`.
pub struct Aggregator {
    max_songs: usize,
    exclude: Option<ItemFilter>,
    songs: IndexMap<String, NormalizedItem>,
    page_results: Vec<PageResult>,
    pages_checked: usize,
}

impl Aggregator {
    pub fn new(settings: &FeedSettings) -> Self {
        Self {
            max_songs: settings.max_songs,
            exclude: settings.exclude.clone(),
            songs: IndexMap::new(),
            page_results: Vec::new(),
            pages_checked: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.max_songs > 0 && self.songs.len() >= self.max_songs
    }

    /// Merges a successfully fetched page.
    pub fn merge(&mut self, page: PageResult) -> MergeOutcome {
        let mut outcome = MergeOutcome {
            end_of_data: page.items.is_empty(),
            ..MergeOutcome::default()
        };

        for item in &page.items {
            if self.is_full() {
                break;
            }
            let Some(id) = item.identity() else {
                tracing::trace!(
                    page = page.index,
                    name = %item.name(),
                    "Dropping item without identity"
                );
                continue;
            };
            if self.songs.contains_key(id) {
                continue;
            }
            if self.exclude.as_ref().is_some_and(|exclude| exclude(item)) {
                continue;
            }
            self.songs.insert(id.to_string(), item.clone());
            outcome.added += 1;
        }

        outcome.limit_reached = self.is_full();
        self.pages_checked += 1;
        tracing::debug!(
            page = page.index,
            added = outcome.added,
            total = self.songs.len(),
            "Merged page"
        );
        self.page_results.push(page);
        outcome
    }

    /// Keeps a faulted page for diagnostics. It does not count as checked.
    pub fn record_fault(&mut self, page: PageResult) {
        self.page_results.push(page);
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }

    pub fn pages_checked(&self) -> usize {
        self.pages_checked
    }

    /// Builds the terminal result. The run succeeded only when it completed
    /// without an error.
    pub fn finish(self, state: DriverState, error: Option<FeedError>) -> FeedResult {
        FeedResult {
            success: error.is_none() && state == DriverState::Completed,
            error,
            songs: self.songs,
            page_results: self.page_results,
            pages_checked: self.pages_checked,
            state,
        }
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("max_songs", &self.max_songs)
            .field("songs", &self.songs.len())
            .field("pages_checked", &self.pages_checked)
            .finish()
    }
}
