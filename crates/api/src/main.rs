use std::sync::Arc;

use anyhow::Context;

use pressflow_api::app::{self, services::AppServices};
use pressflow_api::config::ServerConfig;
use pressflow_events::ExecutionEventBus;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pressflow_observability::init();

    let config = ServerConfig::from_env().context("failed to load configuration")?;
    let services = Arc::new(build_services(&config).await?);

    let workers = services
        .start_workers(services.builtin_handlers(), config.worker.clone())
        .context("failed to start worker pool")?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        workers = workers.worker_ids().len(),
        "listening"
    );

    app::serve(listener, services.clone(), shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down; waiting for in-flight jobs");
    tokio::task::spawn_blocking(move || workers.stop())
        .await
        .context("worker pool shutdown panicked")?;

    Ok(())
}

#[cfg(feature = "postgres")]
async fn build_services(config: &ServerConfig) -> anyhow::Result<AppServices> {
    use pressflow_infra::jobs::PostgresJobRepository;

    let Some(url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set; using in-memory job store");
        return Ok(AppServices::in_memory(config.sse_keep_alive));
    };

    let repository = PostgresJobRepository::connect(url)
        .await
        .context("failed to connect to Postgres")?;
    repository
        .ensure_schema()
        .await
        .context("failed to prepare jobs schema")?;

    Ok(AppServices::new(
        ExecutionEventBus::new(),
        Arc::new(repository),
        config.sse_keep_alive,
    ))
}

#[cfg(not(feature = "postgres"))]
async fn build_services(config: &ServerConfig) -> anyhow::Result<AppServices> {
    if config.database_url.is_some() {
        tracing::warn!(
            "DATABASE_URL is ignored without the postgres feature; using in-memory job store"
        );
    }
    Ok(AppServices::new(
        ExecutionEventBus::new(),
        Arc::new(pressflow_infra::jobs::InMemoryJobRepository::new()),
        config.sse_keep_alive,
    ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
