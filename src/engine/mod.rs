//! Concurrency engine of a feed run.
//!
//! - [`pipeline`] - bounded, admission-controlled worker pool
//! - [`rate_limit`] - per-route call budgets reported by services
//! - [`aggregator`] - de-duplicating, bounded merge of page results
//! - [`driver`] - the state machine tying them together

pub mod aggregator;
pub mod driver;
pub mod pipeline;
pub mod rate_limit;

pub use aggregator::{Aggregator, MergeOutcome};
pub use driver::{run_feed, run_feeds, stream_feed, FeedStream};
pub use pipeline::{BoundedPipeline, PipelineConfig, PipelineError, UnitHandle, UnitState};
pub use rate_limit::{route_key, RateLimiter, RouteLimitState, Throttle};
