//! Concurrent reader for paginated custom map feeds.
//!
//! `mapfeeds` walks the paged listings of several map indexes (BeatSaver,
//! BeastSaber, ScoreSaber), normalizes every page into [`feed::NormalizedItem`]s
//! and folds them into one ordered, de-duplicated [`feed::FeedResult`].
//!
//! - [`engine`] - bounded pipeline, rate limiter, aggregator and feed driver
//! - [`feed`] - data model, feed kinds and per-service parsers
//! - [`transport`] - the HTTP collaborator the driver fetches pages through
//! - [`context`] - the explicitly constructed state shared by feed runs
//!
//! # Example
//!
//! ```no_run
//! use mapfeeds::context::FeedContext;
//! use mapfeeds::engine::run_feed;
//! use mapfeeds::feed::{FeedKind, FeedSettings};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let ctx = FeedContext::from_config(&mapfeeds::config::Config::default())?;
//! let settings = FeedSettings::new(FeedKind::BeatSaverLatest).with_max_songs(50);
//! let result = run_feed(&ctx, &settings, &CancellationToken::new()).await;
//! println!("{} maps from {} pages", result.songs.len(), result.pages_checked);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod feed;
pub mod transport;
