//! Server-side change stream.
//!
//! Write paths publish through the [`ChangeEmitter`]; the [`EventBus`] fans
//! each event out to the subscribers of the same organization, and
//! [`event_stream_response`] turns one subscription into an SSE response.

mod bus;
mod emitter;
mod sse;

pub use bus::{EventBus, Frame, RealtimeConfig, Subscription};
pub use emitter::ChangeEmitter;
pub use sse::{event_stream_response, frame_event};
