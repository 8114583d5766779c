//! HostPilot client cache layer
//!
//! Two cache layers kept consistent with server-side changes:
//!
//! - **Fast cache**: short-lived raw responses keyed by request URL
//! - **Query cache**: parsed data keyed by structured query keys, observed by the UI
//!
//! The [`CacheManager`] purges both layers for a changed resource type and
//! cascades to the dependents declared in the [`ResourceGraph`].
//!
//! ## Configuration
//!
//! Cache bounds are controlled via `hostpilot.toml`:
//!
//! ```toml
//! [cache]
//! fast_cache_limit = 500
//! fast_cache_ttl_secs = 1800
//! query_stale_time_secs = 300
//! query_gc_time_secs = 600
//! ```

mod config;
mod fast;
mod graph;
mod http;
mod keys;
mod lock;
mod manager;
mod planner;
mod query;

pub use config::CacheConfig;
pub use fast::FastCache;
pub use graph::ResourceGraph;
pub use http::HttpQueryFetcher;
pub use keys::{QueryKey, QueryKeyPart};
pub use manager::{CacheManager, InvalidateOptions, InvalidationReport, ResourceFailure};
pub use planner::InvalidationPlan;
pub use query::{
    MemoryQueryCache, QueryCache, QueryError, QueryFetcher, QueryObserver, QueryPredicate,
    RefetchOutcome,
};
