//! Dispatch table from [`FeedKind`] to the functions that drive it.
//!
//! Each kind is described by a [`FeedDescriptor`]: how to validate settings,
//! how to build the locator of a page, and how to parse a page body. Adding a
//! feed means adding a variant and one descriptor.
use super::types::{FeedSettings, NormalizedItem};
use super::{beastsaber, beatsaver, scoresaber};
use crate::error::ParseError;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Remote index a feed belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    BeatSaver,
    BeastSaber,
    ScoreSaber,
}

/// Every supported feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    BeatSaverLatest,
    BeatSaverMapper,
    BeatSaverSearch,
    BeastSaberBookmarks,
    BeastSaberFollowings,
    BeastSaberCuratorRecommended,
    ScoreSaberTrending,
    ScoreSaberLatestRanked,
    ScoreSaberTopPlayed,
    ScoreSaberTopRanked,
    ScoreSaberSearch,
}

/// Base URLs of the remote services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub beatsaver: Url,
    pub beastsaber: Url,
    pub scoresaber: Url,
}

impl Endpoints {
    pub const BEATSAVER: &'static str = "https://api.beatsaver.com";
    pub const BEASTSABER: &'static str = "https://bsaber.com";
    pub const SCORESABER: &'static str = "https://scoresaber.com";

    /// Points every service at one base URL (used with mock servers).
    pub fn all(base: Url) -> Self {
        Self {
            beatsaver: base.clone(),
            beastsaber: base.clone(),
            scoresaber: base,
        }
    }

    pub fn base(&self, service: Service) -> &Url {
        match service {
            Service::BeatSaver => &self.beatsaver,
            Service::BeastSaber => &self.beastsaber,
            Service::ScoreSaber => &self.scoresaber,
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        // Constant, known-valid URLs
        Self {
            beatsaver: Url::parse(Self::BEATSAVER).expect("valid BeatSaver URL"),
            beastsaber: Url::parse(Self::BEASTSABER).expect("valid BeastSaber URL"),
            scoresaber: Url::parse(Self::SCORESABER).expect("valid ScoreSaber URL"),
        }
    }
}

/// Options passed to every page parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    pub store_raw: bool,
}

pub type ValidateFn = fn(&FeedSettings) -> Result<(), String>;
pub type LocatorFn = fn(&Url, &FeedSettings, usize) -> Result<Url, url::ParseError>;
pub type ParseFn = fn(&[u8], &Url, &ParseOptions) -> Result<Vec<NormalizedItem>, ParseError>;

/// The functions and properties that define one feed kind.
pub struct FeedDescriptor {
    pub kind: FeedKind,
    pub name: &'static str,
    pub service: Service,
    /// Pages must be merged in page-index order
    pub ordered: bool,
    pub validate: ValidateFn,
    /// Builds the locator for a page index from the service base URL
    pub locator: LocatorFn,
    pub parse: ParseFn,
}

impl fmt::Debug for FeedDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedDescriptor")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("service", &self.service)
            .field("ordered", &self.ordered)
            .finish()
    }
}

impl FeedDescriptor {
    pub fn page_url(
        &self,
        endpoints: &Endpoints,
        settings: &FeedSettings,
        page: usize,
    ) -> Result<Url, url::ParseError> {
        (self.locator)(endpoints.base(self.service), settings, page)
    }
}

impl FeedKind {
    pub const ALL: [FeedKind; 11] = [
        FeedKind::BeatSaverLatest,
        FeedKind::BeatSaverMapper,
        FeedKind::BeatSaverSearch,
        FeedKind::BeastSaberBookmarks,
        FeedKind::BeastSaberFollowings,
        FeedKind::BeastSaberCuratorRecommended,
        FeedKind::ScoreSaberTrending,
        FeedKind::ScoreSaberLatestRanked,
        FeedKind::ScoreSaberTopPlayed,
        FeedKind::ScoreSaberTopRanked,
        FeedKind::ScoreSaberSearch,
    ];

    pub fn descriptor(self) -> &'static FeedDescriptor {
        match self {
            FeedKind::BeatSaverLatest => &beatsaver::LATEST,
            FeedKind::BeatSaverMapper => &beatsaver::MAPPER,
            FeedKind::BeatSaverSearch => &beatsaver::SEARCH,
            FeedKind::BeastSaberBookmarks => &beastsaber::BOOKMARKS,
            FeedKind::BeastSaberFollowings => &beastsaber::FOLLOWINGS,
            FeedKind::BeastSaberCuratorRecommended => &beastsaber::CURATOR_RECOMMENDED,
            FeedKind::ScoreSaberTrending => &scoresaber::TRENDING,
            FeedKind::ScoreSaberLatestRanked => &scoresaber::LATEST_RANKED,
            FeedKind::ScoreSaberTopPlayed => &scoresaber::TOP_PLAYED,
            FeedKind::ScoreSaberTopRanked => &scoresaber::TOP_RANKED,
            FeedKind::ScoreSaberSearch => &scoresaber::SEARCH,
        }
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    pub fn service(self) -> Service {
        self.descriptor().service
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FeedKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        FeedKind::ALL
            .into_iter()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| {
                let names: Vec<_> = FeedKind::ALL.iter().map(|k| k.name()).collect();
                format!("unknown feed '{}' (expected one of: {})", s, names.join(", "))
            })
    }
}

// ============================================================================
// Shared helpers for descriptors
// ============================================================================

/// Appends `path` to `base`, keeping any path prefix the base carries.
pub(crate) fn endpoint(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined)
}

pub(crate) fn no_requirements(_: &FeedSettings) -> Result<(), String> {
    Ok(())
}

pub(crate) fn require_query(settings: &FeedSettings) -> Result<(), String> {
    match settings.query() {
        Some(_) => Ok(()),
        None => Err(format!(
            "feed '{}' requires a non-empty search query",
            settings.kind
        )),
    }
}

pub(crate) fn require_author(settings: &FeedSettings) -> Result<(), String> {
    match settings.author() {
        Some(_) => Ok(()),
        None => Err(format!("feed '{}' requires an author", settings.kind)),
    }
}
