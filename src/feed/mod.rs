//! Feed data model and the remote services feeds are read from.
//!
//! - `types` - items, settings and results shared by every feed
//! - `kinds` - the [`FeedKind`] dispatch table (validate, locate, parse)
//! - `beatsaver`, `beastsaber`, `scoresaber` - per-service descriptors and
//!   page parsers
//!
//! Parsers are plain functions from a page body to items; they hold no state
//! and never touch the network.

mod beastsaber;
mod beatsaver;
mod kinds;
mod scoresaber;
mod types;

pub use kinds::{Endpoints, FeedDescriptor, FeedKind, ParseOptions, Service};
pub use types::{
    merge_results, DriverState, FeedCriterion, FeedResult, FeedSettings, ItemFilter,
    NormalizedItem, PageResult,
};

/// Page parsers, exposed for callers that fetch pages themselves.
pub mod parsers {
    pub use super::beastsaber::{
        parse_json_page as beastsaber_json, parse_rss_page as beastsaber_rss,
    };
    pub use super::beatsaver::parse_page as beatsaver;
    pub use super::scoresaber::parse_page as scoresaber;
}
