use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use pressflow_core::{JobId, RunId};
use pressflow_infra::jobs::JobQueueError;

use crate::app::routes::system;
use crate::app::services::{AppServices, SharedJobQueue};
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/stats", get(system::job_stats))
        .route("/:id", get(get_job))
        .route("/:id/requeue", post(requeue_job))
}

/// Run a queue operation off the async executor.
///
/// Repositories may block (the Postgres one drives its own runtime handle).
async fn with_queue<T, F>(services: &AppServices, op: F) -> Result<T, axum::response::Response>
where
    T: Send + 'static,
    F: FnOnce(&SharedJobQueue) -> Result<T, JobQueueError> + Send + 'static,
{
    let queue = services.queue().clone();
    match tokio::task::spawn_blocking(move || op(&queue)).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(errors::queue_error_to_response(e)),
        Err(e) => Err(errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            e.to_string(),
        )),
    }
}

fn parse_job_id(id: &str) -> Result<JobId, axum::response::Response> {
    id.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

/// POST /jobs
pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateJobRequest>,
) -> axum::response::Response {
    let run_id = match body.run_id.map(RunId::new).transpose() {
        Ok(v) => v,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };
    let max_attempts = body.max_attempts.unwrap_or(dto::DEFAULT_MAX_ATTEMPTS);
    let (job_type, payload) = (body.job_type, body.payload);

    let job = match with_queue(&services, move |queue| match run_id {
        Some(run_id) => queue.enqueue_for_run(job_type, payload, max_attempts, run_id),
        None => queue.enqueue(job_type, payload, max_attempts),
    })
    .await
    {
        Ok(job) => job,
        Err(resp) => return resp,
    };

    (StatusCode::CREATED, Json(job)).into_response()
}

/// GET /jobs?status=&limit=
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let status = match query.status() {
        Ok(s) => s,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", msg),
    };
    let limit = query.limit();

    match with_queue(&services, move |queue| queue.list(status, limit)).await {
        Ok(jobs) => Json(serde_json::json!({ "jobs": jobs })).into_response(),
        Err(resp) => resp,
    }
}

/// GET /jobs/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match with_queue(&services, move |queue| queue.get(job_id)).await {
        Ok(job) => Json(job).into_response(),
        Err(resp) => resp,
    }
}

/// POST /jobs/:id/requeue
///
/// Puts a dead or failed job back in line, keeping its attempt count.
pub async fn requeue_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match with_queue(&services, move |queue| {
        let job = queue.get(job_id)?;
        queue.requeue(job)
    })
    .await
    {
        Ok(job) => Json(job).into_response(),
        Err(resp) => resp,
    }
}
