use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::callbacks::receive_callback;
use super::health::{health, stats};
use super::metrics::prometheus_metrics;
use super::outbox::{get_outbox_message, list_dead_letters, trigger_dispatch};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health, stats & metrics
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        .nest(
            "/api/v1",
            Router::new()
                // Outbox operator surface
                .route("/outbox/dead-letters", get(list_dead_letters))
                .route("/outbox/dispatch", post(trigger_dispatch))
                .route("/outbox/{id}", get(get_outbox_message))
                // Inbound signed callbacks
                .route("/callbacks/{key_id}", post(receive_callback)),
        )
}
