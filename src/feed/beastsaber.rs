//! BeastSaber feeds: a user's bookmarks, maps from followed mappers, and
//! curator recommendations.
//!
//! Bookmarks and curator picks come from the WordPress JSON API; followings
//! are only published as an RSS activity feed, parsed with `feed-rs`.
//! BeastSaber pages are one-based, so page index 0 requests `page=1`.
use super::kinds::{
    endpoint, no_requirements, require_author, FeedDescriptor, FeedKind, ParseOptions, Service,
};
use super::types::{FeedSettings, NormalizedItem};
use crate::error::ParseError;
use feed_rs::parser;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

const CURATOR_ACCOUNT: &str = "curatorrecommended";
const DOWNLOAD_BASE: &str = "https://beatsaver.com/api/download/key/";
const SONG_PAGE_BASE: &str = "https://bsaber.com/songs/";

pub(crate) static BOOKMARKS: FeedDescriptor = FeedDescriptor {
    kind: FeedKind::BeastSaberBookmarks,
    name: "beastsaber-bookmarks",
    service: Service::BeastSaber,
    ordered: false,
    validate: require_author,
    locator: bookmarks_url,
    parse: parse_json_page,
};

pub(crate) static FOLLOWINGS: FeedDescriptor = FeedDescriptor {
    kind: FeedKind::BeastSaberFollowings,
    name: "beastsaber-followings",
    service: Service::BeastSaber,
    ordered: true,
    validate: require_author,
    locator: followings_url,
    parse: parse_rss_page,
};

pub(crate) static CURATOR_RECOMMENDED: FeedDescriptor = FeedDescriptor {
    kind: FeedKind::BeastSaberCuratorRecommended,
    name: "beastsaber-curator",
    service: Service::BeastSaber,
    ordered: false,
    validate: no_requirements,
    locator: curator_url,
    parse: parse_json_page,
};

fn songs_api_url(
    base: &Url,
    bookmarked_by: &str,
    settings: &FeedSettings,
    page: usize,
) -> Result<Url, url::ParseError> {
    let mut url = endpoint(base, "wp-json/bsaber-api/songs/")?;
    url.query_pairs_mut()
        .append_pair("bookmarked_by", bookmarked_by)
        .append_pair("page", &(page + 1).to_string())
        .append_pair("count", &settings.songs_per_page.max(1).to_string());
    Ok(url)
}

fn bookmarks_url(base: &Url, settings: &FeedSettings, page: usize) -> Result<Url, url::ParseError> {
    songs_api_url(base, settings.author().unwrap_or_default(), settings, page)
}

fn curator_url(base: &Url, settings: &FeedSettings, page: usize) -> Result<Url, url::ParseError> {
    songs_api_url(base, CURATOR_ACCOUNT, settings, page)
}

fn followings_url(
    base: &Url,
    settings: &FeedSettings,
    page: usize,
) -> Result<Url, url::ParseError> {
    let user = settings.author().unwrap_or_default();
    let mut url = endpoint(base, &format!("members/{user}/wall/followings/feed/"))?;
    url.query_pairs_mut().append_pair("acpage", &(page + 1).to_string());
    Ok(url)
}

#[derive(Debug, Deserialize)]
struct Song {
    #[serde(default)]
    title: String,
    #[serde(default)]
    song_key: String,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    level_author_name: String,
}

fn song_links(key: &str) -> (Option<Url>, Option<Url>) {
    if key.is_empty() {
        return (None, None);
    }
    let download = Url::parse(DOWNLOAD_BASE).and_then(|b| b.join(key)).ok();
    let source = Url::parse(SONG_PAGE_BASE)
        .and_then(|b| b.join(&format!("{key}/")))
        .ok();
    (download, source)
}

/// Parses one page of the BeastSaber songs API (`{"songs": [...]}`).
pub fn parse_json_page(
    body: &[u8],
    source: &Url,
    options: &ParseOptions,
) -> Result<Vec<NormalizedItem>, ParseError> {
    let page: Value = serde_json::from_slice(body)?;
    let songs = match page {
        Value::Object(mut obj) => match obj.remove("songs") {
            Some(Value::Array(songs)) => songs,
            // The API reports an exhausted listing with a null song list
            Some(Value::Null) => Vec::new(),
            _ => return Err(ParseError::Shape("missing 'songs' array".to_string())),
        },
        _ => return Err(ParseError::Shape("expected a JSON object".to_string())),
    };

    let mut items = Vec::with_capacity(songs.len());
    for song in songs {
        let raw = options.store_raw.then(|| song.to_string());
        let song: Song = match serde_json::from_value(song) {
            Ok(song) => song,
            Err(e) => {
                tracing::debug!(source = %source, error = %e, "Skipping malformed BeastSaber song");
                continue;
            }
        };
        let key = song.song_key.trim().to_lowercase();
        let (download, page) = song_links(&key);
        items.push(
            NormalizedItem::new(&song.hash, &key, song.title, song.level_author_name)
                .with_download_uri(download)
                .with_source_uri(page)
                .with_raw(raw),
        );
    }

    Ok(items)
}

/// Parses one page of the followings RSS feed.
///
/// Entries identify maps only through their link (`/songs/<key>/`), so the
/// resulting items carry a key but no hash. Entries without a song link keep
/// an empty key and are dropped during aggregation. The RSS parser does not
/// expose per-entry source text, so no raw payload is kept.
pub fn parse_rss_page(
    body: &[u8],
    source: &Url,
    _options: &ParseOptions,
) -> Result<Vec<NormalizedItem>, ParseError> {
    let feed = parser::parse(body).map_err(|e| ParseError::Xml(e.to_string()))?;

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry
                .links
                .first()
                .and_then(|l| Url::parse(&l.href).ok());
            let key = link.as_ref().and_then(key_from_song_link).unwrap_or_default();
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());
            let author = entry
                .authors
                .into_iter()
                .next()
                .map(|p| p.name)
                .unwrap_or_default();
            let (download, _) = song_links(&key);
            NormalizedItem::new("", &key, title, author)
                .with_download_uri(download)
                .with_source_uri(link)
        })
        .collect::<Vec<_>>();

    tracing::trace!(source = %source, entries = items.len(), "Parsed followings feed page");
    Ok(items)
}

/// Extracts `<key>` from `https://bsaber.com/songs/<key>/`.
fn key_from_song_link(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    while let Some(segment) = segments.next() {
        if segment == "songs" {
            return segments
                .next()
                .filter(|k| !k.is_empty())
                .map(str::to_lowercase);
        }
    }
    None
}
