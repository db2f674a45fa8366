//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::cache::CacheStats;
use crate::outbox::{DispatcherStatsSnapshot, OutboxStats};
use crate::publisher::{MessageBusStats, MessagePublisher};
use crate::secrets::{SecretCacheStats, SecretProvider};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub worker_id: String,
    pub outbox: OutboxHealthResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresHealthResponse>,
    pub publisher: String,
    pub secret_provider: String,
}

#[derive(Debug, Serialize)]
pub struct OutboxHealthResponse {
    pub backend: String,
    pub reachable: bool,
}

#[derive(Debug, Serialize)]
pub struct PostgresHealthResponse {
    pub status: String,
    pub connected: bool,
    pub pool_size: u32,
    pub idle_connections: u32,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub outbox: Option<OutboxStats>,
    pub dispatcher: DispatcherStatsSnapshot,
    pub cache: CacheStats,
    pub bus: MessageBusStats,
    pub secrets: SecretCacheStats,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = state.start_time.elapsed().as_secs();
    let outbox_reachable = state.outbox.stats().await.is_ok();

    let postgres = match &state.postgres_pool {
        Some(pool) => {
            let connected = pool.health_check().await;
            let inner_pool = pool.pool();
            Some(PostgresHealthResponse {
                status: if connected { "connected" } else { "unreachable" }.to_string(),
                connected,
                pool_size: inner_pool.size(),
                idle_connections: inner_pool.num_idle() as u32,
            })
        }
        None => None,
    };

    let postgres_ok = postgres.as_ref().map_or(true, |p| p.connected);
    let status = if outbox_reachable && postgres_ok {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        worker_id: state.dispatcher.config().worker_id.clone(),
        outbox: OutboxHealthResponse {
            backend: state.settings.outbox.backend.clone(),
            reachable: outbox_reachable,
        },
        postgres,
        publisher: state.bus.publisher_type().to_string(),
        secret_provider: state.secrets.provider_type().to_string(),
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let outbox = match state.outbox.stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read outbox stats");
            None
        }
    };

    Json(StatsResponse {
        outbox,
        dispatcher: state.dispatcher.stats(),
        cache: state.cache.stats().await,
        bus: state.bus.stats(),
        secrets: state.secrets.stats().await,
    })
}
