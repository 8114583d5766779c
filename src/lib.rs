//! HostPilot realtime change stream and dependency-aware cache invalidation.
//!
//! The server half ([`realtime`]) fans change events out to subscribed
//! sessions. The client half ([`subscription`] and [`cache`]) keeps one
//! stream open per session and turns each event into an invalidation pass
//! over the local caches.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
pub mod realtime;
pub mod subscription;

pub use hostpilot_realtime_types as types;
