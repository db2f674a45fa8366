use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use event_relay_service::config::Settings;
use event_relay_service::postgres::PostgresPool;
use event_relay_service::server::{create_app, AppState};
use event_relay_service::shutdown::GracefulShutdown;
use event_relay_service::tasks::{CacheSweepTask, OutboxPollTask};
use event_relay_service::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    init_telemetry(&settings.logging)?;
    tracing::info!("Configuration loaded");

    // PostgreSQL is only needed for the durable outbox
    let postgres_pool = if settings.outbox.backend == "postgres" {
        let pool = PostgresPool::connect(&settings.database).await?;
        pool.ensure_schema().await?;
        Some(pool)
    } else {
        None
    };

    // Create application state
    let state = AppState::new(settings.clone(), postgres_pool.clone())?;

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    // Start outbox poll task in background
    let poll_task = OutboxPollTask::new(
        state.dispatcher.clone(),
        &settings.outbox,
        shutdown_tx.subscribe(),
    );
    let poll_handle = tokio::spawn(poll_task.run());

    // Start cache sweep task in background
    let sweep_task = CacheSweepTask::new(
        state.cache.clone(),
        Duration::from_secs(settings.cache.sweep_interval_seconds),
        shutdown_tx.subscribe(),
    );
    let sweep_handle = tokio::spawn(sweep_task.run());

    // Create Axum app
    let app = create_app(state.clone());

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler())
        .await?;

    // Stop background tasks and release resources
    GracefulShutdown::new(state.outbox.clone(), postgres_pool, shutdown_tx)
        .execute("server stopped", vec![poll_handle, sweep_handle])
        .await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
