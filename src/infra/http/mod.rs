//! HTTP surface of the realtime service.

mod middleware;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::application::error::HttpError;
use crate::realtime::{ChangeEmitter, EventBus, event_stream_response};

pub use middleware::{REQUEST_ID_HEADER, RequestContext};

const SOURCE_EVENTS: &str = "infra::http::realtime_events";

#[derive(Clone)]
pub struct RealtimeState {
    pub bus: Arc<EventBus>,
    pub emitter: ChangeEmitter,
}

impl RealtimeState {
    pub fn new(bus: Arc<EventBus>) -> Self {
        let emitter = ChangeEmitter::new(Arc::clone(&bus));
        Self { bus, emitter }
    }
}

pub fn build_router(state: RealtimeState) -> Router {
    Router::new()
        .route("/api/realtime/events", get(realtime_events))
        .route("/api/realtime/status", get(realtime_status))
        .route("/health", get(health))
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StreamQuery {
    #[serde(rename = "organizationId")]
    organization_id: Option<String>,
}

impl StreamQuery {
    fn organization_id(&self) -> Result<Option<i64>, HttpError> {
        let Some(raw) = self.organization_id.as_deref().map(str::trim) else {
            return Ok(None);
        };
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse::<i64>().map(Some).map_err(|err| {
            HttpError::new(
                SOURCE_EVENTS,
                StatusCode::BAD_REQUEST,
                "Invalid organizationId",
                format!("`{raw}` is not an organization id: {err}"),
            )
        })
    }
}

async fn realtime_events(
    State(state): State<RealtimeState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let organization_id = match query.organization_id() {
        Ok(organization_id) => organization_id,
        Err(err) => return err.into_response(),
    };

    let subscription = state.bus.add_client(organization_id);
    info!(
        client_id = %subscription.client_id(),
        organization_id = ?organization_id,
        "Realtime client connected"
    );
    event_stream_response(subscription)
}

#[derive(Debug, Serialize)]
struct StatusBody {
    clients: usize,
}

async fn realtime_status(State(state): State<RealtimeState>) -> Json<StatusBody> {
    Json(StatusBody {
        clients: state.bus.client_count(),
    })
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}
