use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::outbox::OutboxMessage;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const MESSAGE_ID_HEADER: &str = "message-id";
pub const TENANT_ID_HEADER: &str = "tenant-id";
pub const EVENT_TYPE_HEADER: &str = "event-type";
pub const AGGREGATE_TYPE_HEADER: &str = "aggregate-type";
pub const AGGREGATE_ID_HEADER: &str = "aggregate-id";
pub const AGGREGATE_VERSION_HEADER: &str = "aggregate-version";
pub const OCCURRED_AT_HEADER: &str = "occurred-at";

/// Namespace for idempotency keys derived from outbox message ids.
const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b7e_93d4_4a51_8e0f_5c3a_d2b1_7e49);

/// Deterministic idempotency key for an outbox message.
///
/// Every redelivery of the same message carries the same key.
pub fn idempotency_key_for(message_id: Uuid) -> String {
    Uuid::new_v5(&IDEMPOTENCY_NAMESPACE, message_id.as_bytes()).to_string()
}

/// A message addressed to a bus topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message: serde_json::Value,
    pub topic: String,
    pub tenant_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl MessageEnvelope {
    /// Create an envelope. The idempotency key is mandatory.
    pub fn new(
        topic: impl Into<String>,
        tenant_id: Option<String>,
        message: serde_json::Value,
        idempotency_key: impl Into<String>,
    ) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(IDEMPOTENCY_KEY_HEADER.to_string(), idempotency_key.into());
        if let Some(tenant) = &tenant_id {
            headers.insert(TENANT_ID_HEADER.to_string(), tenant.clone());
        }

        Self {
            message,
            topic: topic.into(),
            tenant_id,
            headers,
        }
    }

    /// Envelope for one outbox message on one topic.
    pub fn for_outbox(message: &OutboxMessage, topic: &str) -> Self {
        Self::new(
            topic,
            message.tenant_id.clone(),
            message.payload.clone(),
            idempotency_key_for(message.id),
        )
        .with_header(MESSAGE_ID_HEADER, message.id.to_string())
        .with_header(EVENT_TYPE_HEADER, message.event_type.clone())
        .with_header(AGGREGATE_TYPE_HEADER, message.aggregate_type.clone())
        .with_header(AGGREGATE_ID_HEADER, message.aggregate_id.clone())
        .with_header(AGGREGATE_VERSION_HEADER, message.aggregate_version.to_string())
        .with_header(OCCURRED_AT_HEADER, message.occurred_at.to_rfc3339())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.headers.get(IDEMPOTENCY_KEY_HEADER).map(String::as_str)
    }
}
