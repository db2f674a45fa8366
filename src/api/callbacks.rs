//! Inbound signed callbacks.
//!
//! Partners sign callbacks the same way outbound webhooks are signed:
//! `X-Webhook-Signature: sha256=<hex>` over `{timestamp}.{body}` with the
//! timestamp in `X-Webhook-Timestamp`. Accepted callbacks are forwarded to
//! the internal bus.

use std::str::FromStr;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::publisher::{MessageEnvelope, MessagePublisher, PublishError};
use crate::server::AppState;
use crate::signature::{SignatureAlgorithm, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::webhook::TENANT_HEADER;

/// Topic receiving verified callbacks
pub const CALLBACK_TOPIC: &str = "callbacks.inbound";

/// Envelope header naming the key that verified the callback
const CALLBACK_KEY_HEADER: &str = "callback-key-id";

#[derive(Debug, Serialize)]
pub struct CallbackAccepted {
    pub accepted: bool,
    pub idempotency_key: String,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// The algorithm named by the signature prefix, else the configured default.
fn algorithm_for(signature: &str, default: SignatureAlgorithm) -> SignatureAlgorithm {
    signature
        .split_once('=')
        .and_then(|(prefix, _)| SignatureAlgorithm::from_str(prefix).ok())
        .unwrap_or(default)
}

/// POST /api/v1/callbacks/{key_id}
pub async fn receive_callback(
    State(state): State<AppState>,
    Path(key_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<CallbackAccepted>)> {
    let signature = header(&headers, SIGNATURE_HEADER)
        .ok_or_else(|| AppError::Validation(format!("Missing {} header", SIGNATURE_HEADER)))?;
    let timestamp = header(&headers, TIMESTAMP_HEADER)
        .ok_or_else(|| AppError::Validation(format!("Missing {} header", TIMESTAMP_HEADER)))?;

    let algorithm = algorithm_for(signature, state.signing_algorithm);
    state
        .signatures
        .verify_inbound(&body, signature, timestamp, algorithm, Some(&key_id), Utc::now())
        .await
        .map_err(|failure| {
            tracing::warn!(key_id = %key_id, reason = %failure, "Rejected inbound callback");
            AppError::Auth(format!("Callback rejected: {}", failure))
        })?;

    let message: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Callback body is not JSON: {}", e)))?;

    // A redelivered callback carries the same signature, hence the same key
    let idempotency_key = Uuid::new_v5(&Uuid::NAMESPACE_OID, signature.as_bytes()).to_string();
    let tenant_id = header(&headers, TENANT_HEADER).map(str::to_string);

    let envelope = MessageEnvelope::new(CALLBACK_TOPIC, tenant_id, message, idempotency_key.clone())
        .with_header(CALLBACK_KEY_HEADER, key_id.clone());

    state.bus.publish(envelope).await.map_err(|e| match e {
        PublishError::Transient(detail) => AppError::Unavailable(detail),
        PublishError::Permanent(detail) => AppError::Validation(detail),
    })?;

    tracing::info!(key_id = %key_id, idempotency_key = %idempotency_key, "Inbound callback accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(CallbackAccepted {
            accepted: true,
            idempotency_key,
        }),
    ))
}
