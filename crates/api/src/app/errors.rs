use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use pressflow_infra::jobs::{JobQueueError, JobStoreError};

pub fn queue_error_to_response(err: JobQueueError) -> axum::response::Response {
    match err {
        JobQueueError::Invalid(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        JobQueueError::NotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        JobQueueError::Transition { .. } => {
            json_error(StatusCode::CONFLICT, "invalid_transition", err.to_string())
        }
        JobQueueError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        JobStoreError::AlreadyExists(_) | JobStoreError::Conflict(_) => {
            json_error(StatusCode::CONFLICT, "conflict", err.to_string())
        }
        JobStoreError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
