//! ScoreSaber leaderboard feeds.
//!
//! Every feed is a category of `/api/leaderboards`. Leaderboards are per
//! difficulty, so one page usually lists the same map several times; the
//! aggregator collapses them by hash. ScoreSaber does not know BeatSaver keys,
//! so items carry a hash only.
use super::kinds::{
    endpoint, no_requirements, require_query, FeedDescriptor, FeedKind, ParseOptions, Service,
};
use super::types::{FeedSettings, NormalizedItem};
use crate::error::ParseError;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

const DOWNLOAD_BASE: &str = "https://r2cdn.beatsaver.com/";
const LEADERBOARD_PAGE_BASE: &str = "https://scoresaber.com/leaderboard/";

pub(crate) static TRENDING: FeedDescriptor = FeedDescriptor {
    kind: FeedKind::ScoreSaberTrending,
    name: "scoresaber-trending",
    service: Service::ScoreSaber,
    ordered: false,
    validate: no_requirements,
    locator: trending_url,
    parse: parse_page,
};

pub(crate) static LATEST_RANKED: FeedDescriptor = FeedDescriptor {
    kind: FeedKind::ScoreSaberLatestRanked,
    name: "scoresaber-latest-ranked",
    service: Service::ScoreSaber,
    ordered: true,
    validate: no_requirements,
    locator: latest_ranked_url,
    parse: parse_page,
};

pub(crate) static TOP_PLAYED: FeedDescriptor = FeedDescriptor {
    kind: FeedKind::ScoreSaberTopPlayed,
    name: "scoresaber-top-played",
    service: Service::ScoreSaber,
    ordered: false,
    validate: no_requirements,
    locator: top_played_url,
    parse: parse_page,
};

pub(crate) static TOP_RANKED: FeedDescriptor = FeedDescriptor {
    kind: FeedKind::ScoreSaberTopRanked,
    name: "scoresaber-top-ranked",
    service: Service::ScoreSaber,
    ordered: false,
    validate: no_requirements,
    locator: top_ranked_url,
    parse: parse_page,
};

pub(crate) static SEARCH: FeedDescriptor = FeedDescriptor {
    kind: FeedKind::ScoreSaberSearch,
    name: "scoresaber-search",
    service: Service::ScoreSaber,
    ordered: false,
    validate: require_query,
    locator: search_url,
    parse: parse_page,
};

/// Leaderboard list categories understood by the API.
#[derive(Debug, Clone, Copy)]
enum Category {
    Trending = 0,
    DateRanked = 1,
    ScoresSet = 2,
    StarDifficulty = 3,
}

fn leaderboards_url(
    base: &Url,
    category: Category,
    ranked: bool,
    page: usize,
) -> Result<Url, url::ParseError> {
    let mut url = endpoint(base, "api/leaderboards")?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("category", &(category as u8).to_string())
            .append_pair("sort", "0")
            .append_pair("page", &(page + 1).to_string())
            .append_pair("withMetadata", "true");
        if ranked {
            query.append_pair("ranked", "true");
        }
    }
    Ok(url)
}

fn trending_url(base: &Url, _: &FeedSettings, page: usize) -> Result<Url, url::ParseError> {
    leaderboards_url(base, Category::Trending, false, page)
}

fn latest_ranked_url(base: &Url, _: &FeedSettings, page: usize) -> Result<Url, url::ParseError> {
    leaderboards_url(base, Category::DateRanked, true, page)
}

fn top_played_url(base: &Url, _: &FeedSettings, page: usize) -> Result<Url, url::ParseError> {
    leaderboards_url(base, Category::ScoresSet, false, page)
}

fn top_ranked_url(base: &Url, _: &FeedSettings, page: usize) -> Result<Url, url::ParseError> {
    leaderboards_url(base, Category::StarDifficulty, true, page)
}

fn search_url(base: &Url, settings: &FeedSettings, page: usize) -> Result<Url, url::ParseError> {
    let mut url = leaderboards_url(base, Category::Trending, false, page)?;
    url.query_pairs_mut()
        .append_pair("search", settings.query().unwrap_or_default());
    Ok(url)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Leaderboard {
    id: u64,
    song_hash: String,
    #[serde(default)]
    song_name: String,
    #[serde(default)]
    song_sub_name: String,
    #[serde(default)]
    level_author_name: String,
}

/// Parses one `{"leaderboards": [...], "metadata": {...}}` page.
pub fn parse_page(
    body: &[u8],
    source: &Url,
    options: &ParseOptions,
) -> Result<Vec<NormalizedItem>, ParseError> {
    let page: Value = serde_json::from_slice(body)?;
    let boards = match page {
        Value::Object(mut obj) => match obj.remove("leaderboards") {
            Some(Value::Array(boards)) => boards,
            _ => {
                return Err(ParseError::Shape(
                    "missing 'leaderboards' array".to_string(),
                ))
            }
        },
        _ => return Err(ParseError::Shape("expected a JSON object".to_string())),
    };

    let mut items = Vec::with_capacity(boards.len());
    for board in boards {
        let raw = options.store_raw.then(|| board.to_string());
        let board: Leaderboard = match serde_json::from_value(board) {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(source = %source, error = %e, "Skipping malformed leaderboard");
                continue;
            }
        };

        let name = if board.song_sub_name.trim().is_empty() {
            board.song_name
        } else {
            format!("{} {}", board.song_name, board.song_sub_name.trim())
        };
        let download = Url::parse(DOWNLOAD_BASE)
            .and_then(|b| b.join(&format!("{}.zip", board.song_hash.trim().to_lowercase())))
            .ok();
        let leaderboard_page = Url::parse(LEADERBOARD_PAGE_BASE)
            .and_then(|b| b.join(&board.id.to_string()))
            .ok();

        items.push(
            NormalizedItem::new(&board.song_hash, "", name, board.level_author_name)
                .with_download_uri(download)
                .with_source_uri(leaderboard_page)
                .with_raw(raw),
        );
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PAGE: &str = r#"{
        "leaderboards": [
            {"id": 501, "songHash": "c0ffee", "songName": "Freedom Dive", "songSubName": "(xi)", "levelAuthorName": "Hexagonial", "ranked": true},
            {"id": 502, "songHash": "C0FFEE", "songName": "Freedom Dive", "songSubName": "(xi)", "levelAuthorName": "Hexagonial", "ranked": true},
            {"id": 503, "songName": "No hash"}
        ],
        "metadata": {"total": 3, "page": 1, "itemsPerPage": 14}
    }"#;

    fn source() -> Url {
        Url::parse("https://scoresaber.com/api/leaderboards?page=1").unwrap()
    }

    #[test]
    fn test_parse_page() {
        let items = parse_page(PAGE.as_bytes(), &source(), &ParseOptions::default()).unwrap();
        // The entry without a hash is malformed and skipped
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].hash(), "C0FFEE");
        assert_eq!(items[0].key(), "");
        assert_eq!(items[0].name(), "Freedom Dive (xi)");
        assert_eq!(
            items[0].download_uri().map(Url::as_str),
            Some("https://r2cdn.beatsaver.com/c0ffee.zip")
        );
        assert_eq!(
            items[0].source_uri().map(Url::as_str),
            Some("https://scoresaber.com/leaderboard/501")
        );
        // Difficulties of one map share the hash
        assert_eq!(items[0].identity(), items[1].identity());
    }

    #[test]
    fn test_missing_leaderboards_is_shape_error() {
        let err = parse_page(br#"[]"#, &source(), &ParseOptions::default()).unwrap_err();
        assert!(matches!(err, ParseError::Shape(_)));
    }

    #[test]
    fn test_locators() {
        let base = Url::parse("https://scoresaber.com").unwrap();
        let settings = FeedSettings::new(FeedKind::ScoreSaberLatestRanked);
        assert_eq!(
            latest_ranked_url(&base, &settings, 0).unwrap().as_str(),
            "https://scoresaber.com/api/leaderboards?category=1&sort=0&page=1&withMetadata=true&ranked=true"
        );

        let settings = FeedSettings::new(FeedKind::ScoreSaberSearch).with_query("halcyon");
        let url = search_url(&base, &settings, 1).unwrap();
        assert!(url.as_str().ends_with("page=2&withMetadata=true&search=halcyon"));
    }
}
