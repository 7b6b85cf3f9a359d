use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::errors;
use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /jobs/stats
pub async fn job_stats(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let queue = services.queue().clone();
    match tokio::task::spawn_blocking(move || queue.stats()).await {
        Ok(Ok(stats)) => Json(serde_json::json!({
            "jobs": stats,
            "total": stats.total(),
            "subscriptions": services.bus().total_subscription_count(),
        }))
        .into_response(),
        Ok(Err(e)) => errors::queue_error_to_response(e),
        Err(e) => errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            e.to_string(),
        ),
    }
}
