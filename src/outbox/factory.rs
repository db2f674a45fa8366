//! Outbox store factory

use std::sync::Arc;

use crate::config::OutboxConfig;
use crate::postgres::PostgresPool;

use super::memory_store::MemoryOutboxStore;
use super::postgres_store::PostgresOutboxStore;
use super::store::OutboxStore;

/// Create an outbox store based on configuration.
///
/// - `"postgres"`: a `PostgresOutboxStore` when a pool is provided
/// - `"memory"` (default): a `MemoryOutboxStore`
///
/// A postgres backend without a pool falls back to memory with a warning.
pub fn create_outbox_store(
    config: &OutboxConfig,
    postgres_pool: Option<&PostgresPool>,
) -> Arc<dyn OutboxStore> {
    match config.backend.as_str() {
        "postgres" => {
            if let Some(pool) = postgres_pool {
                tracing::info!(
                    backend = "postgres",
                    url = %pool.database_url_masked(),
                    "Creating PostgreSQL outbox store"
                );
                Arc::new(PostgresOutboxStore::new(
                    pool.pool().clone(),
                    config.max_attempts,
                ))
            } else {
                tracing::warn!(
                    "PostgreSQL outbox requested but no pool provided, falling back to memory"
                );
                Arc::new(MemoryOutboxStore::new(config.max_attempts))
            }
        }
        _ => {
            tracing::info!(backend = "memory", "Creating memory outbox store");
            Arc::new(MemoryOutboxStore::new(config.max_attempts))
        }
    }
}
