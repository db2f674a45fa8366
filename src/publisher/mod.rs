//! Message bus publishing.
//!
//! The relay only consumes a publish contract; the broker itself is an
//! external collaborator. `InMemoryMessageBus` is the in-process
//! implementation used by default and in tests.

mod envelope;
mod memory_bus;

pub use envelope::{
    idempotency_key_for, MessageEnvelope, AGGREGATE_ID_HEADER, AGGREGATE_TYPE_HEADER,
    AGGREGATE_VERSION_HEADER, EVENT_TYPE_HEADER, IDEMPOTENCY_KEY_HEADER, MESSAGE_ID_HEADER,
    OCCURRED_AT_HEADER, TENANT_ID_HEADER,
};
pub use memory_bus::{InMemoryMessageBus, MessageBusStats};

use async_trait::async_trait;
use thiserror::Error;

use crate::error::FailureKind;

/// Errors returned by a publish call.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    /// Timeout or broker unavailable; safe to retry
    #[error("Transient publish failure: {0}")]
    Transient(String),

    /// Serialization or schema rejection; retrying cannot succeed
    #[error("Publish rejected: {0}")]
    Permanent(String),
}

impl PublishError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PublishError::Transient(_) => FailureKind::Transient,
            PublishError::Permanent(_) => FailureKind::Permanent,
        }
    }
}

/// Delivers envelopes to the internal bus.
///
/// No ordering guarantee is required; callers enforce ordering upstream.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), PublishError>;

    /// Backend identifier for health reporting
    fn publisher_type(&self) -> &'static str;
}
