use axum::Router;

pub mod jobs;
pub mod runs;
pub mod system;

/// Router for every endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/runs", runs::router())
}
