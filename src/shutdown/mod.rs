//! Graceful shutdown handling for the relay.
//!
//! Shutdown runs in order:
//! 1. Signal background tasks to stop (a running dispatch cycle finishes first)
//! 2. Wait for the tasks within the drain timeout, aborting stragglers
//! 3. Report messages left in `Dispatching`; the next worker resets them
//! 4. Close the PostgreSQL pool

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::outbox::OutboxStore;
use crate::postgres::PostgresPool;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for background tasks to stop (default: 15 seconds)
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(15),
        }
    }
}

/// Handles graceful shutdown of the relay
pub struct GracefulShutdown {
    store: Arc<dyn OutboxStore>,
    postgres_pool: Option<PostgresPool>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        postgres_pool: Option<PostgresPool>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self::with_config(store, postgres_pool, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn OutboxStore>,
        postgres_pool: Option<PostgresPool>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            store,
            postgres_pool,
            shutdown_tx,
            config,
        }
    }

    /// Execute the shutdown sequence for the given background tasks.
    #[tracing::instrument(name = "graceful_shutdown", skip(self, tasks), fields(tasks = tasks.len()))]
    pub async fn execute(&self, reason: &str, tasks: Vec<JoinHandle<()>>) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Signaling background tasks");
        // No receivers left means every task already stopped
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 2: Waiting for background tasks");
        let (stopped, aborted) = self.drain_tasks(tasks).await;
        result.tasks_stopped = stopped;
        result.tasks_aborted = aborted;

        tracing::info!("Phase 3: Checking in-flight outbox messages");
        result.in_flight_messages = match self.store.stats().await {
            Ok(stats) => stats.dispatching,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read outbox stats during shutdown");
                0
            }
        };
        if result.in_flight_messages > 0 {
            tracing::warn!(
                in_flight = result.in_flight_messages,
                "Outbox messages left dispatching; they are reset once their lease expires"
            );
        }

        if let Some(pool) = &self.postgres_pool {
            tracing::info!("Phase 4: Closing PostgreSQL pool");
            pool.close().await;
        }

        result.duration = start.elapsed();
        result.success = result.tasks_aborted == 0;

        tracing::info!(
            tasks_stopped = result.tasks_stopped,
            tasks_aborted = result.tasks_aborted,
            in_flight = result.in_flight_messages,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    async fn drain_tasks(&self, tasks: Vec<JoinHandle<()>>) -> (usize, usize) {
        let total = tasks.len();
        let abort_handles: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let mut pending: FuturesUnordered<_> = tasks.into_iter().collect();
        let mut stopped = 0;

        let drain = async {
            while let Some(joined) = pending.next().await {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "Background task ended abnormally");
                }
                stopped += 1;
            }
        };

        if timeout(self.config.drain_timeout, drain).await.is_err() {
            tracing::warn!(
                remaining = total - stopped,
                "Drain timeout reached, aborting remaining background tasks"
            );
            for handle in &abort_handles {
                handle.abort();
            }
        }

        (stopped, total - stopped)
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether every task stopped within the drain timeout
    pub success: bool,
    pub tasks_stopped: usize,
    pub tasks_aborted: usize,
    /// Messages still marked `Dispatching` after the tasks stopped
    pub in_flight_messages: usize,
    /// Total time taken for shutdown
    pub duration: Duration,
}
