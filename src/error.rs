//! Error taxonomy shared by the engine, the transport and the parsers.
//!
//! Every failure a feed run can report is a [`FeedError`]. Callers that only
//! need the category match on [`FeedError::kind`].
use std::fmt;
use thiserror::Error;

// ============================================================================
// Transport
// ============================================================================

/// Failures of a single page request.
///
/// Messages are captured as strings so the error can be cloned into both the
/// faulted [`PageResult`](crate::feed::PageResult) and the terminal result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(String),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// HTTP response with a non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Route is throttled for longer than the throttle policy allows
    #[error("Rate limited: next call allowed in {wait_secs}s")]
    RateLimited { wait_secs: u64 },
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// The request was abandoned because the run was cancelled
    #[error("Request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Failures converting a page body into items.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    Json(String),
    #[error("Invalid feed XML: {0}")]
    Xml(String),
    /// Well-formed body that does not have the expected structure
    #[error("Unexpected page structure: {0}")]
    Shape(String),
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::Json(err.to_string())
    }
}

// ============================================================================
// Feed runs
// ============================================================================

/// Terminal error of a feed run or fault of one page.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// The settings are not valid for the chosen feed kind. Detected before
    /// any network access.
    #[error("Invalid feed settings: {0}")]
    InvalidFeedSettings(String),
    #[error("Transport fault on {url}: {source}")]
    Transport { url: String, source: TransportError },
    #[error("Parse fault on {url}: {source}")]
    Parse { url: String, source: ParseError },
    #[error("Feed run cancelled")]
    Cancelled,
    /// The pipeline refused a non-blocking submission
    #[error("Pipeline at capacity ({0} units queued or running)")]
    CapacityExceeded(usize),
}

impl FeedError {
    /// Builds a transport fault, folding cancelled requests into [`FeedError::Cancelled`].
    pub fn transport(url: impl Into<String>, source: TransportError) -> Self {
        match source {
            TransportError::Cancelled => FeedError::Cancelled,
            source => FeedError::Transport {
                url: url.into(),
                source,
            },
        }
    }

    pub fn parse(url: impl Into<String>, source: ParseError) -> Self {
        FeedError::Parse {
            url: url.into(),
            source,
        }
    }

    pub fn kind(&self) -> FeedErrorKind {
        match self {
            FeedError::InvalidFeedSettings(_) => FeedErrorKind::InvalidFeedSettings,
            FeedError::Transport { .. } => FeedErrorKind::TransportFault,
            FeedError::Parse { .. } => FeedErrorKind::ParseFault,
            FeedError::Cancelled => FeedErrorKind::Cancelled,
            FeedError::CapacityExceeded(_) => FeedErrorKind::CapacityExceeded,
        }
    }
}

/// Coarse classification of a [`FeedError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum FeedErrorKind {
    InvalidFeedSettings,
    TransportFault,
    ParseFault,
    Cancelled,
    CapacityExceeded,
}

impl fmt::Display for FeedErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeedErrorKind::InvalidFeedSettings => "invalid-feed-settings",
            FeedErrorKind::TransportFault => "transport-fault",
            FeedErrorKind::ParseFault => "parse-fault",
            FeedErrorKind::Cancelled => "cancelled",
            FeedErrorKind::CapacityExceeded => "capacity-exceeded",
        };
        f.write_str(name)
    }
}
