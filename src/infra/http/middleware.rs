use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request, Uri},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
const EVENTS_PATH: &str = "/api/realtime/events";
const MAX_REQUEST_ID_LEN: usize = 128;

/// Per-request facts shared by the logging layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: String,
    /// Raw `organizationId` query value, as sent.
    pub organization_id: Option<String>,
    /// True for the realtime streaming route.
    pub stream: bool,
}

impl RequestContext {
    /// Reuses a caller-supplied `x-request-id` of at most 128 visible
    /// characters, otherwise generates one.
    pub fn from_request(request: &Request<Body>) -> Self {
        let request_id = request
            .headers()
            .get(&REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty() && value.len() <= MAX_REQUEST_ID_LEN)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            request_id,
            organization_id: organization_query(request.uri()),
            stream: request.uri().path() == EVENTS_PATH,
        }
    }
}

fn organization_query(uri: &Uri) -> Option<String> {
    url::form_urlencoded::parse(uri.query()?.as_bytes())
        .find(|(name, _)| name == "organizationId")
        .map(|(_, value)| value.into_owned())
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let ctx = RequestContext::from_request(&request);
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

/// Log failed responses with the diagnostic chain attached by the handler,
/// and the opening of each event stream.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();
    let ctx = request.extensions().get::<RequestContext>().cloned();
    let (request_id, organization_id, stream) = match ctx {
        Some(ctx) => (ctx.request_id, ctx.organization_id, ctx.stream),
        None => (String::new(), None, false),
    };
    let organization_id = organization_id.unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis();

    if status.is_success() {
        if stream {
            debug!(
                target: "hostpilot::http::stream",
                request_id = %request_id,
                organization_id = %organization_id,
                elapsed_ms,
                "event stream opened"
            );
        }
        return response;
    }
    if !(status.is_client_error() || status.is_server_error()) {
        return response;
    }

    let (source, messages) = match response.extensions_mut().remove::<ErrorReport>() {
        Some(report) => (report.source, report.messages),
        None => ("unknown", Vec::new()),
    };
    let detail = messages
        .first()
        .cloned()
        .unwrap_or_else(|| "no diagnostic available".to_string());

    if status.is_server_error() {
        error!(
            target: "hostpilot::http::response",
            status = status.as_u16(),
            method = %method,
            path = %path,
            stream,
            organization_id = %organization_id,
            elapsed_ms,
            source,
            detail = %detail,
            chain = ?messages,
            request_id = %request_id,
            "request failed"
        );
    } else {
        warn!(
            target: "hostpilot::http::response",
            status = status.as_u16(),
            method = %method,
            path = %path,
            stream,
            organization_id = %organization_id,
            elapsed_ms,
            source,
            detail = %detail,
            chain = ?messages,
            request_id = %request_id,
            "client request error"
        );
    }

    response
}
