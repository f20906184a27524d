//! Per-route call budget tracking.
//!
//! Services report the remaining calls in the current window and when the
//! window resets. The limiter keeps the latest report per route key and
//! answers whether the next call to that route has to wait.
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use url::Url;

/// Header pairs (remaining, reset) understood by the limiter, in lookup order.
const LIMIT_HEADERS: [(&str, &str); 2] = [
    // BeatSaver
    ("rate-limit-remaining", "rate-limit-reset"),
    // ScoreSaber
    ("x-ratelimit-remaining", "x-ratelimit-reset"),
];
const RETRY_AFTER: &str = "retry-after";

/// Reset values below this are seconds from now rather than a unix timestamp.
const RELATIVE_RESET_CUTOFF: i64 = 1_000_000_000;

/// Budget of one route for its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteLimitState {
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

/// Decision for the next call to a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    Proceed,
    Wait(Duration),
}

impl Throttle {
    pub fn wait(self) -> Option<Duration> {
        match self {
            Throttle::Proceed => None,
            Throttle::Wait(d) => Some(d),
        }
    }
}

/// Reduces a request URL to the key its rate limit is accounted under.
///
/// Keeps host and port, drops the query string, and replaces path segments
/// that vary per page or per item (numbers, hex keys, hashes) with `{}`.
pub fn route_key(url: &Url) -> String {
    let mut key = String::new();
    key.push_str(url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        key.push(':');
        key.push_str(&port.to_string());
    }

    if let Some(segments) = url.path_segments() {
        for segment in segments.filter(|s| !s.is_empty()) {
            key.push('/');
            if is_variable_segment(segment) {
                key.push_str("{}");
            } else {
                key.push_str(segment);
            }
        }
    }
    key
}

fn is_variable_segment(segment: &str) -> bool {
    if segment.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if !segment.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    // Content hashes, then map keys ("2a3b")
    segment.len() == 40 || (segment.len() >= 4 && segment.chars().any(|c| c.is_ascii_digit()))
}

/// Reads a (remaining, reset) pair from response headers.
///
/// `Retry-After` alone means the budget is exhausted until the given delay
/// has passed.
pub fn parse_limit_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Option<RouteLimitState> {
    let header_i64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };

    for (remaining_name, reset_name) in LIMIT_HEADERS {
        if let (Some(remaining), Some(reset)) =
            (header_i64(remaining_name), header_i64(reset_name))
        {
            let reset_at = if reset < RELATIVE_RESET_CUTOFF {
                now + chrono::Duration::seconds(reset)
            } else {
                DateTime::from_timestamp(reset, 0)?
            };
            return Some(RouteLimitState {
                remaining,
                reset_at,
            });
        }
    }

    header_i64(RETRY_AFTER).map(|secs| RouteLimitState {
        remaining: 0,
        reset_at: truncate_to_second(now + chrono::Duration::seconds(secs.max(0))),
    })
}

fn truncate_to_second(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}

/// Registry of route budgets, shared by every fetch of a context.
#[derive(Debug, Default)]
pub struct RateLimiter {
    routes: Mutex<HashMap<String, RouteLimitState>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<String, RouteLimitState>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores the budget reported for `route`.
    ///
    /// Responses can be applied out of order, so a report for an older window
    /// never replaces a newer one, and two reports for the same window keep
    /// the lower remaining count.
    pub fn record(&self, route: &str, remaining: i64, reset_at: DateTime<Utc>) {
        let update = RouteLimitState {
            remaining,
            reset_at,
        };
        let mut routes = self.routes();
        match routes.get_mut(route) {
            Some(current) if update.reset_at < current.reset_at => {
                tracing::trace!(route = %route, "Ignoring rate limit report for an older window");
            }
            Some(current) if update.reset_at == current.reset_at => {
                current.remaining = current.remaining.min(update.remaining);
            }
            _ => {
                routes.insert(route.to_string(), update);
            }
        }
    }

    /// Records the budget carried by `headers`, if any. Returns what was read.
    pub fn record_headers(&self, route: &str, headers: &HeaderMap) -> Option<RouteLimitState> {
        self.record_headers_at(route, headers, Utc::now())
    }

    pub fn record_headers_at(
        &self,
        route: &str,
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> Option<RouteLimitState> {
        let state = parse_limit_headers(headers, now)?;
        self.record(route, state.remaining, state.reset_at);
        if state.remaining <= 0 {
            tracing::debug!(
                route = %route,
                reset_at = %state.reset_at,
                "Rate limit budget exhausted"
            );
        }
        Some(state)
    }

    /// Whether the next call to `route` may go out now.
    pub fn should_throttle(&self, route: &str) -> Throttle {
        self.should_throttle_at(route, Utc::now())
    }

    pub fn should_throttle_at(&self, route: &str, now: DateTime<Utc>) -> Throttle {
        let routes = self.routes();
        let Some(state) = routes.get(route) else {
            return Throttle::Proceed;
        };
        if state.remaining > 0 || state.reset_at <= now {
            return Throttle::Proceed;
        }
        match (state.reset_at - now).to_std() {
            Ok(wait) if !wait.is_zero() => Throttle::Wait(wait),
            _ => Throttle::Proceed,
        }
    }

    pub fn state(&self, route: &str) -> Option<RouteLimitState> {
        self.routes().get(route).copied()
    }

    pub fn len(&self) -> usize {
        self.routes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes().is_empty()
    }

    pub fn clear(&self) {
        self.routes().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use reqwest::header::HeaderValue;
    use std::sync::Arc;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_route_key_strips_pages_and_query() {
        assert_eq!(
            route_key(&url("https://api.beatsaver.com/search/text/3?q=ghost&sortOrder=Relevance")),
            "api.beatsaver.com/search/text/{}"
        );
        assert_eq!(
            route_key(&url("https://api.beatsaver.com/search/text/0?sortOrder=Latest")),
            route_key(&url("https://api.beatsaver.com/search/text/7?sortOrder=Latest")),
        );
        assert_eq!(
            route_key(&url("https://api.beatsaver.com/maps/uploader/4284/2")),
            "api.beatsaver.com/maps/uploader/{}/{}"
        );
        assert_eq!(
            route_key(&url("https://api.beatsaver.com/maps/id/2a3b")),
            "api.beatsaver.com/maps/id/{}"
        );
        assert_eq!(
            route_key(&url("http://127.0.0.1:8080/api/leaderboards?page=4")),
            "127.0.0.1:8080/api/leaderboards"
        );
    }

    #[test]
    fn test_words_are_not_variable() {
        assert!(!is_variable_segment("search"));
        assert!(!is_variable_segment("feed"));
        // Hex letters only, no digit
        assert!(!is_variable_segment("deaf"));
        assert!(is_variable_segment("ff01"));
        assert!(is_variable_segment("12"));
    }

    #[test]
    fn test_unknown_route_proceeds() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.should_throttle("example.com/maps"), Throttle::Proceed);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_exhausted_budget_waits_until_reset() {
        let limiter = RateLimiter::new();
        let now = at(1_700_000_000);
        limiter.record("r", 0, now + chrono::Duration::seconds(5));

        match limiter.should_throttle_at("r", now) {
            Throttle::Wait(wait) => assert_eq!(wait, Duration::from_secs(5)),
            other => panic!("Expected Wait, got {:?}", other),
        }
        assert_eq!(
            limiter.should_throttle_at("r", now + chrono::Duration::seconds(6)),
            Throttle::Proceed
        );
    }

    #[test]
    fn test_exhausted_budget_with_wall_clock() {
        let limiter = RateLimiter::new();
        limiter.record("r", 0, Utc::now() + chrono::Duration::seconds(5));
        assert!(limiter.should_throttle("r").wait().unwrap() > Duration::ZERO);

        limiter.clear();
        limiter.record("r", 0, Utc::now() - chrono::Duration::seconds(1));
        assert_eq!(limiter.should_throttle("r"), Throttle::Proceed);
    }

    #[test]
    fn test_remaining_budget_proceeds() {
        let limiter = RateLimiter::new();
        let now = at(1_700_000_000);
        limiter.record("r", 3, now + chrono::Duration::seconds(60));
        assert_eq!(limiter.should_throttle_at("r", now), Throttle::Proceed);
    }

    #[test]
    fn test_older_window_does_not_replace_newer() {
        let limiter = RateLimiter::new();
        limiter.record("r", 0, at(200));
        limiter.record("r", 50, at(100));
        assert_eq!(
            limiter.state("r"),
            Some(RouteLimitState {
                remaining: 0,
                reset_at: at(200)
            })
        );
    }

    #[test]
    fn test_same_window_keeps_lowest_remaining() {
        let limiter = RateLimiter::new();
        limiter.record("r", 3, at(100));
        limiter.record("r", 7, at(100));
        assert_eq!(limiter.state("r").unwrap().remaining, 3);

        // A new window replaces the old one
        limiter.record("r", 10, at(160));
        assert_eq!(limiter.state("r").unwrap().remaining, 10);
    }

    #[test]
    fn test_parse_beatsaver_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("rate-limit-remaining", HeaderValue::from_static("9"));
        headers.insert("rate-limit-reset", HeaderValue::from_static("1700000060"));
        let state = parse_limit_headers(&headers, at(1_700_000_000)).unwrap();
        assert_eq!(state.remaining, 9);
        assert_eq!(state.reset_at, at(1_700_000_060));
    }

    #[test]
    fn test_parse_scoresaber_relative_reset() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("30"));
        let state = parse_limit_headers(&headers, at(1_700_000_000)).unwrap();
        assert_eq!(state.remaining, 0);
        assert_eq!(state.reset_at, at(1_700_000_030));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("12"));
        let state = parse_limit_headers(&headers, at(1_700_000_000)).unwrap();
        assert_eq!(state.remaining, 0);
        assert_eq!(state.reset_at, at(1_700_000_012));
    }

    #[test]
    fn test_no_limit_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        assert!(parse_limit_headers(&headers, Utc::now()).is_none());

        let limiter = RateLimiter::new();
        assert!(limiter.record_headers("r", &headers).is_none());
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_concurrent_records() {
        let limiter = Arc::new(RateLimiter::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    for n in 0..100 {
                        limiter.record("shared", 100 - n, at(1_000 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let state = limiter.state("shared").unwrap();
        assert_eq!(state.reset_at, at(1_007));
        assert_eq!(state.remaining, 1);
        assert_eq!(limiter.len(), 1);
    }
}
