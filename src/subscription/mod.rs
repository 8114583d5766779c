//! Client-side realtime subscription.
//!
//! Keeps one event stream open per session, reconnecting with exponential
//! backoff, and coalesces inbound change events into invalidation passes
//! handed to an [`InvalidationSink`] (normally the
//! [`CacheManager`](crate::cache::CacheManager)).

mod client;
mod config;
mod debounce;
mod policy;
mod transport;

pub use client::{EventObserver, SubscriptionClient, SubscriptionState};
pub use config::SubscriptionConfig;
pub use debounce::{DebounceState, Debouncer, InvalidationSink};
pub use policy::ReconnectPolicy;
pub use transport::{
    EventTransport, FrameStream, HttpTransport, SseDecoder, SseFrame, TransportError,
};
