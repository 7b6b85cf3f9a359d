//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: shared bus, job queue and stream adapter, plus built-in job handlers
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::future::Future;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tokio::net::TcpListener;
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}

/// Serve the router until `shutdown` resolves, then drain open connections.
///
/// Open run streams only end once their bus registrations are gone, so the
/// bus is cleared as soon as shutdown begins; otherwise graceful shutdown
/// would wait on every connected SSE client.
pub async fn serve<F>(
    listener: TcpListener,
    services: Arc<services::AppServices>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_app(services.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!(
                streams = services.bus().total_subscription_count(),
                "shutdown requested; closing run streams"
            );
            services.bus().clear();
        })
        .await
}
