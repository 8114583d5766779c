//! Streaming HTTP response for one subscriber.

use std::convert::Infallible;

use async_stream::stream;
use axum::http::{HeaderValue, header};
use axum::response::{
    IntoResponse, Response,
    sse::{Event, Sse},
};
use tracing::debug;

use super::bus::{Frame, Subscription};

const X_ACCEL_BUFFERING: &str = "x-accel-buffering";

/// Render a queued frame as an SSE event.
pub fn frame_event(frame: &Frame) -> Event {
    match frame {
        Frame::Data(json) => Event::default().data(json.as_ref()),
        Frame::Heartbeat => Event::default().comment("heartbeat"),
    }
}

/// Stream the subscriber's queue until it is removed from the bus or the
/// client goes away.
///
/// The subscription moves into the body stream, so closing the connection
/// drops it and unregisters the subscriber.
pub fn event_stream_response(mut subscription: Subscription) -> Response {
    let stream = stream! {
        while let Some(frame) = subscription.recv().await {
            yield Ok::<Event, Infallible>(frame_event(&frame));
        }
        debug!(client_id = %subscription.client_id(), "Subscriber stream ended");
    };

    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::to_bytes;

    use super::super::bus::EventBus;
    use super::*;

    #[tokio::test]
    async fn response_carries_streaming_headers() {
        let bus = Arc::new(EventBus::default());
        let response = event_stream_response(bus.add_client(Some(1)));

        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[X_ACCEL_BUFFERING], "no");
    }

    #[tokio::test]
    async fn body_ends_after_close_all() {
        let bus = Arc::new(EventBus::default());
        let response = event_stream_response(bus.add_client(Some(1)));
        bus.close_all();

        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body collects");
        let text = String::from_utf8(body.to_vec()).expect("utf-8 body");
        assert!(text.starts_with("data: {\"type\":\"connected\""));
        assert!(text.ends_with("\n\n"));
    }
}
