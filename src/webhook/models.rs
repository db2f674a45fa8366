use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::error::FailureKind;
use crate::signature::{SignatureAlgorithm, SignatureError};

/// Configuration problems detected before any attempt is made.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Invalid webhook endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Webhook signing secret is empty")]
    MissingSecret,

    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,

    #[error("Invalid webhook header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("Header '{0}' is set by the dispatcher and cannot be overridden")]
    ReservedHeader(String),

    #[error("Failed to sign webhook payload: {0}")]
    Signing(#[from] SignatureError),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

/// A single webhook delivery, signed with `secret`.
#[derive(Clone)]
pub struct WebhookDispatchRequest {
    pub endpoint: String,
    pub secret: Vec<u8>,
    pub algorithm: SignatureAlgorithm,
    pub tenant_id: Option<String>,
    pub event_type: String,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    /// Per-attempt timeout
    pub timeout: Duration,
    pub max_attempts: u32,
    pub idempotency_key: Option<String>,
}

impl WebhookDispatchRequest {
    pub fn new(
        endpoint: impl Into<String>,
        secret: impl Into<Vec<u8>>,
        event_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            secret: secret.into(),
            algorithm: SignatureAlgorithm::default(),
            tenant_id: None,
            event_type: event_type.into(),
            payload: payload.into(),
            headers: HashMap::new(),
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            idempotency_key: None,
        }
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl std::fmt::Debug for WebhookDispatchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookDispatchRequest")
            .field("endpoint", &self.endpoint)
            .field("secret", &"[REDACTED]")
            .field("algorithm", &self.algorithm)
            .field("tenant_id", &self.tenant_id)
            .field("event_type", &self.event_type)
            .field("payload_bytes", &self.payload.len())
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// Outcome of a dispatch across all its attempts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WebhookDispatchResult {
    pub delivered: bool,
    pub attempts: u32,
    pub last_status_code: Option<u16>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// One entry per failed attempt, in attempt order
    pub failure_reasons: Vec<String>,
    /// Classification of the last failed attempt
    pub last_failure: Option<FailureKind>,
}

impl WebhookDispatchResult {
    pub fn last_reason(&self) -> Option<&str> {
        self.failure_reasons.last().map(String::as_str)
    }
}
