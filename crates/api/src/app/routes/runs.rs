//! Per-run execution event stream and the publish endpoint feeding it.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::debug;

use pressflow_core::RunId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/:run_id/stream", get(stream_run))
        .route("/:run_id/events", post(publish_event))
}

fn parse_run_id(raw: String) -> Result<RunId, axum::response::Response> {
    RunId::new(raw)
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}

/// GET /runs/:run_id/stream
///
/// `text/event-stream` of the run's execution events. The first event is
/// always `connected`; each later one is named after the event type and
/// carries the event JSON. Disconnecting releases the subscription.
pub async fn stream_run(
    Extension(services): Extension<Arc<AppServices>>,
    Path(run_id): Path<String>,
) -> axum::response::Response {
    let run_id = match parse_run_id(run_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    debug!(run_id = %run_id, "opening run event stream");
    services.run_sse_stream(run_id).into_response()
}

/// POST /runs/:run_id/events
pub async fn publish_event(
    Extension(services): Extension<Arc<AppServices>>,
    Path(run_id): Path<String>,
    Json(body): Json<dto::PublishEventRequest>,
) -> axum::response::Response {
    let run_id = match parse_run_id(run_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let subscribers = services.bus().subscription_count(&run_id);

    let event = match body.into_event(run_id) {
        Ok(e) => e,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_event", msg),
    };
    services.bus().publish(&event);

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "event": event,
            "subscribers": subscribers,
        })),
    )
        .into_response()
}
