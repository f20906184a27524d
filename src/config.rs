//! Configuration file parser for ~/.config/mapfeeds/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted, though we log a warning since they are usually
//! typos.
use crate::feed::Endpoints;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use url::Url;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Command-line flags override these values.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// User-Agent sent with every request.
    pub user_agent: String,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Largest accepted page body in bytes.
    pub max_response_bytes: usize,

    /// Pages fetched at once per feed.
    pub concurrency: usize,

    /// Longest rate-limit wait accepted before a page faults.
    pub max_throttle_wait_secs: u64,

    /// Fetches in flight across all feeds of one invocation (0 = no shared cap).
    pub max_total_fetches: usize,

    /// Base URL overrides, e.g. for mirrors.
    pub endpoints: EndpointsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_agent: format!("mapfeeds/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: 30,
            max_response_bytes: 10 * 1024 * 1024,
            concurrency: 4,
            max_throttle_wait_secs: 60,
            max_total_fetches: 0,
            endpoints: EndpointsConfig::default(),
        }
    }
}

/// `[endpoints]` table. Services left out keep their public base URL.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub beatsaver: Option<Url>,
    pub beastsaber: Option<Url>,
    pub scoresaber: Option<Url>,
}

impl EndpointsConfig {
    pub fn to_endpoints(&self) -> Endpoints {
        let defaults = Endpoints::default();
        Endpoints {
            beatsaver: self.beatsaver.clone().unwrap_or(defaults.beatsaver),
            beastsaber: self.beastsaber.clone().unwrap_or(defaults.beastsaber),
            scoresaber: self.scoresaber.clone().unwrap_or(defaults.scoresaber),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 7] = [
        "user_agent",
        "request_timeout_secs",
        "max_response_bytes",
        "concurrency",
        "max_throttle_wait_secs",
        "max_total_fetches",
        "endpoints",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            concurrency = config.concurrency,
            "Loaded configuration"
        );
        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
