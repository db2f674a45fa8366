//! Outbox operator endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::outbox::{DeliveryState, OutboxMessage};
use crate::server::AppState;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

/// A message with its operator-facing delivery state
#[derive(Debug, Serialize)]
pub struct OutboxStatusResponse {
    pub delivery_state: DeliveryState,
    #[serde(flatten)]
    pub message: OutboxMessage,
}

impl From<OutboxMessage> for OutboxStatusResponse {
    fn from(message: OutboxMessage) -> Self {
        Self {
            delivery_state: message.delivery_state(),
            message,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DeadLetterResponse {
    pub count: usize,
    pub messages: Vec<OutboxStatusResponse>,
}

#[derive(Debug, Serialize)]
pub struct DispatchTriggered {
    pub triggered: bool,
    pub worker_id: String,
}

/// GET /api/v1/outbox/{id}
pub async fn get_outbox_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OutboxStatusResponse>> {
    let message = state
        .outbox
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Outbox message '{}' not found", id)))?;

    Ok(Json(message.into()))
}

/// GET /api/v1/outbox/dead-letters
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<DeadLetterResponse>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .clamp(1, MAX_DEAD_LETTER_LIMIT);

    let messages: Vec<OutboxStatusResponse> = state
        .outbox
        .list_dead_lettered(limit)
        .await?
        .into_iter()
        .map(OutboxStatusResponse::from)
        .collect();

    Ok(Json(DeadLetterResponse {
        count: messages.len(),
        messages,
    }))
}

/// POST /api/v1/outbox/dispatch
///
/// Only wakes the poll task; cycles of one worker never overlap.
pub async fn trigger_dispatch(State(state): State<AppState>) -> (StatusCode, Json<DispatchTriggered>) {
    state.dispatcher.trigger();
    tracing::info!("Dispatch cycle requested via API");

    (
        StatusCode::ACCEPTED,
        Json(DispatchTriggered {
            triggered: true,
            worker_id: state.dispatcher.config().worker_id.clone(),
        }),
    )
}
