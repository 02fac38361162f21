mod api;
mod ingest;
mod problem;
mod rate_limit;
mod registry;
mod retention;
mod router;
mod telemetry;
mod webhook;

use std::{net::SocketAddr, time::Duration};

use tracing::{info, warn};

use hooksink_storage::Database;
use hooksink_util::{load_env_file, AppConfig};

const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database =
        Database::connect_with(&config.database_url, config.database_max_connections).await?;
    database.run_migrations().await?;
    info!(stage = "storage", url = %config.database_url, "database ready");

    let (state, retention_worker) = router::AppState::new(
        metrics,
        database.clone(),
        router::StateSettings::from_config(&config),
    );

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        public_url = %config.public_url,
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router::app_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // The router owned the last state clone, so the worker drains and exits.
    if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, retention_worker)
        .await
        .is_err()
    {
        warn!(stage = "retention", "retention worker did not stop in time");
    }
    database.close().await;
    info!(stage = "app", "server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(stage = "app", error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(stage = "app", "shutdown signal received");
}
