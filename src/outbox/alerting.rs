//! Dead-letter alerting.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::FailureKind;
use crate::publisher::{idempotency_key_for, MessageEnvelope, MessagePublisher};

use super::models::OutboxMessage;

/// Raised once when a message is dead-lettered.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterAlert {
    pub message_id: Uuid,
    pub tenant_id: Option<String>,
    pub aggregate: String,
    pub aggregate_version: i64,
    pub event_type: String,
    pub attempts: u32,
    pub kind: FailureKind,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterAlert {
    pub fn new(message: &OutboxMessage, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            message_id: message.id,
            tenant_id: message.tenant_id.clone(),
            aggregate: message.aggregate_key().to_string(),
            aggregate_version: message.aggregate_version,
            event_type: message.event_type.clone(),
            attempts: message.attempts,
            kind,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Receives dead-letter alerts. Implementations must not fail the caller.
#[async_trait]
pub trait DeadLetterAlerter: Send + Sync {
    async fn alert(&self, alert: &DeadLetterAlert);
}

/// Logs alerts at error level.
#[derive(Debug, Default)]
pub struct TracingAlerter;

#[async_trait]
impl DeadLetterAlerter for TracingAlerter {
    async fn alert(&self, alert: &DeadLetterAlert) {
        tracing::error!(
            message_id = %alert.message_id,
            tenant_id = ?alert.tenant_id,
            aggregate = %alert.aggregate,
            version = alert.aggregate_version,
            event_type = %alert.event_type,
            attempts = alert.attempts,
            kind = %alert.kind,
            reason = %alert.reason,
            "Outbox message dead-lettered"
        );
    }
}

/// Logs alerts and publishes them to a bus topic for operator tooling.
pub struct PublishingAlerter {
    publisher: Arc<dyn MessagePublisher>,
    topic: String,
}

impl PublishingAlerter {
    pub fn new(publisher: Arc<dyn MessagePublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl DeadLetterAlerter for PublishingAlerter {
    async fn alert(&self, alert: &DeadLetterAlert) {
        TracingAlerter.alert(alert).await;

        let message = match serde_json::to_value(alert) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize dead-letter alert");
                return;
            }
        };
        let envelope = MessageEnvelope::new(
            self.topic.as_str(),
            alert.tenant_id.clone(),
            message,
            idempotency_key_for(alert.message_id),
        );
        if let Err(e) = self.publisher.publish(envelope).await {
            tracing::warn!(
                message_id = %alert.message_id,
                error = %e,
                "Failed to publish dead-letter alert"
            );
        }
    }
}
