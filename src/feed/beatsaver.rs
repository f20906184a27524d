//! BeatSaver feeds: latest uploads, uploads by mapper, and text search.
//!
//! All three use the paged JSON API, which returns `{"docs": [...]}` with one
//! document per map. Page indices are zero-based on BeatSaver.
use super::kinds::{
    endpoint, no_requirements, require_query, FeedDescriptor, FeedKind, ParseOptions, Service,
};
use super::types::{FeedSettings, NormalizedItem};
use crate::error::ParseError;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

const MAP_PAGE_BASE: &str = "https://beatsaver.com/maps/";

pub(crate) static LATEST: FeedDescriptor = FeedDescriptor {
    kind: FeedKind::BeatSaverLatest,
    name: "beatsaver-latest",
    service: Service::BeatSaver,
    ordered: true,
    validate: no_requirements,
    locator: latest_url,
    parse: parse_page,
};

pub(crate) static MAPPER: FeedDescriptor = FeedDescriptor {
    kind: FeedKind::BeatSaverMapper,
    name: "beatsaver-mapper",
    service: Service::BeatSaver,
    ordered: true,
    validate: validate_mapper,
    locator: mapper_url,
    parse: parse_page,
};

pub(crate) static SEARCH: FeedDescriptor = FeedDescriptor {
    kind: FeedKind::BeatSaverSearch,
    name: "beatsaver-search",
    service: Service::BeatSaver,
    ordered: false,
    validate: require_query,
    locator: search_url,
    parse: parse_page,
};

fn latest_url(base: &Url, _settings: &FeedSettings, page: usize) -> Result<Url, url::ParseError> {
    let mut url = endpoint(base, &format!("search/text/{page}"))?;
    url.query_pairs_mut().append_pair("sortOrder", "Latest");
    Ok(url)
}

fn mapper_url(base: &Url, settings: &FeedSettings, page: usize) -> Result<Url, url::ParseError> {
    let mapper = settings.author().unwrap_or_default();
    endpoint(base, &format!("maps/uploader/{mapper}/{page}"))
}

fn search_url(base: &Url, settings: &FeedSettings, page: usize) -> Result<Url, url::ParseError> {
    let mut url = endpoint(base, &format!("search/text/{page}"))?;
    url.query_pairs_mut()
        .append_pair("q", settings.query().unwrap_or_default())
        .append_pair("sortOrder", "Relevance");
    Ok(url)
}

/// Uploader pages are addressed by numeric user id.
fn validate_mapper(settings: &FeedSettings) -> Result<(), String> {
    let Some(author) = settings.author() else {
        return Err(format!("feed '{}' requires a mapper id", settings.kind));
    };
    if !author.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!(
            "feed '{}' requires a numeric mapper id, got '{}'",
            settings.kind, author
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct MapDoc {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    uploader: Option<Uploader>,
    #[serde(default)]
    metadata: Option<Metadata>,
    #[serde(default)]
    versions: Vec<Version>,
}

#[derive(Debug, Deserialize)]
struct Uploader {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
    #[serde(default)]
    level_author_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Version {
    hash: String,
    #[serde(rename = "downloadURL", default)]
    download_url: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

/// Parses one page of BeatSaver map documents.
///
/// Documents that don't match the expected shape are skipped with a warning;
/// only an unreadable body or a missing `docs` array fails the page.
pub fn parse_page(
    body: &[u8],
    source: &Url,
    options: &ParseOptions,
) -> Result<Vec<NormalizedItem>, ParseError> {
    let page: Value = serde_json::from_slice(body)?;
    let docs = match page {
        Value::Object(mut obj) => match obj.remove("docs") {
            Some(Value::Array(docs)) => docs,
            _ => return Err(ParseError::Shape("missing 'docs' array".to_string())),
        },
        _ => return Err(ParseError::Shape("expected a JSON object".to_string())),
    };

    let mut items = Vec::with_capacity(docs.len());
    let mut skipped = 0usize;
    for doc in docs {
        let raw = options.store_raw.then(|| doc.to_string());
        match serde_json::from_value::<MapDoc>(doc) {
            Ok(doc) => items.push(to_item(doc, raw)),
            Err(e) => {
                skipped += 1;
                tracing::debug!(source = %source, error = %e, "Skipping malformed BeatSaver map");
            }
        }
    }

    if skipped > 0 {
        tracing::warn!(source = %source, skipped = skipped, "Malformed BeatSaver maps skipped");
    }

    Ok(items)
}

fn to_item(doc: MapDoc, raw: Option<String>) -> NormalizedItem {
    // Newest published version wins; fall back to the newest of any state
    let version = doc
        .versions
        .iter()
        .find(|v| v.state.as_deref() == Some("Published"))
        .or_else(|| doc.versions.first());

    let hash = version.map(|v| v.hash.as_str()).unwrap_or_default();
    let download = version
        .and_then(|v| v.download_url.as_deref())
        .and_then(|u| Url::parse(u).ok());

    let author = doc
        .metadata
        .map(|m| m.level_author_name)
        .filter(|a| !a.is_empty())
        .or_else(|| doc.uploader.map(|u| u.name))
        .unwrap_or_default();

    let source = Url::parse(MAP_PAGE_BASE)
        .and_then(|base| base.join(&doc.id))
        .ok();

    NormalizedItem::new(hash, &doc.id, doc.name, author)
        .with_download_uri(download)
        .with_source_uri(source)
        .with_raw(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PAGE: &str = r#"{
        "docs": [
            {
                "id": "2A3B",
                "name": "Ghost",
                "uploader": {"name": "uploader"},
                "metadata": {"levelAuthorName": "Nolan121405"},
                "versions": [
                    {"hash": "abc123", "downloadURL": "https://r2cdn.beatsaver.com/abc123.zip", "state": "Published"}
                ]
            },
            {
                "id": "ff01",
                "name": "Testing",
                "uploader": {"name": "someone"},
                "versions": [
                    {"hash": "def456", "state": "Testplay"}
                ]
            },
            {"name": "missing id"}
        ]
    }"#;

    fn source() -> Url {
        Url::parse("https://api.beatsaver.com/search/text/0?sortOrder=Latest").unwrap()
    }

    #[test]
    fn test_parse_page() {
        let items = parse_page(PAGE.as_bytes(), &source(), &ParseOptions::default()).unwrap();
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].hash(), "ABC123");
        assert_eq!(items[0].key(), "2a3b");
        assert_eq!(items[0].name(), "Ghost");
        assert_eq!(items[0].level_author(), "Nolan121405");
        assert_eq!(
            items[0].download_uri().map(Url::as_str),
            Some("https://r2cdn.beatsaver.com/abc123.zip")
        );
        assert_eq!(
            items[0].source_uri().map(Url::as_str),
            Some("https://beatsaver.com/maps/2A3B")
        );
        assert!(items[0].raw().is_none());

        // No metadata: uploader name is used as author
        assert_eq!(items[1].level_author(), "someone");
        assert_eq!(items[1].hash(), "DEF456");
        assert!(items[1].download_uri().is_none());
    }

    #[test]
    fn test_parse_keeps_raw_when_asked() {
        let options = ParseOptions { store_raw: true };
        let items = parse_page(PAGE.as_bytes(), &source(), &options).unwrap();
        assert!(items[0].raw().unwrap().contains("Nolan121405"));
    }

    #[test]
    fn test_missing_docs_is_shape_error() {
        let err = parse_page(br#"{"error": "nope"}"#, &source(), &ParseOptions::default())
            .unwrap_err();
        assert!(matches!(err, ParseError::Shape(_)));
    }

    #[test]
    fn test_invalid_json_is_json_error() {
        let err = parse_page(b"<html>", &source(), &ParseOptions::default()).unwrap_err();
        assert!(matches!(err, ParseError::Json(_)));
    }

    #[test]
    fn test_locators() {
        let base = Url::parse("https://api.beatsaver.com").unwrap();
        let settings = FeedSettings::new(FeedKind::BeatSaverSearch).with_query("camellia ghost");
        assert_eq!(
            search_url(&base, &settings, 3).unwrap().as_str(),
            "https://api.beatsaver.com/search/text/3?q=camellia+ghost&sortOrder=Relevance"
        );

        let settings = FeedSettings::new(FeedKind::BeatSaverMapper).with_author("4284");
        assert_eq!(
            mapper_url(&base, &settings, 0).unwrap().as_str(),
            "https://api.beatsaver.com/maps/uploader/4284/0"
        );

        let settings = FeedSettings::new(FeedKind::BeatSaverLatest);
        assert_eq!(
            latest_url(&base, &settings, 1).unwrap().as_str(),
            "https://api.beatsaver.com/search/text/1?sortOrder=Latest"
        );
    }

    #[test]
    fn test_mapper_requires_numeric_id() {
        let settings = FeedSettings::new(FeedKind::BeatSaverMapper).with_author("someone");
        assert!(validate_mapper(&settings).unwrap_err().contains("numeric"));

        let settings = FeedSettings::new(FeedKind::BeatSaverMapper);
        assert!(validate_mapper(&settings).is_err());

        let settings = FeedSettings::new(FeedKind::BeatSaverMapper).with_author("58338");
        assert!(validate_mapper(&settings).is_ok());
    }
}
