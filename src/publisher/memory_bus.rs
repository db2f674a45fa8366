//! In-process message bus using per-topic broadcast channels.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::metrics::PublishMetrics;

use super::{MessageEnvelope, MessagePublisher, PublishError};

/// Default per-topic channel capacity
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default maximum serialized message size (256 KiB)
const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct MessageBusStats {
    pub topics: usize,
    pub published: u64,
    pub rejected: u64,
}

/// In-process bus. Publishing to a topic without subscribers succeeds; the
/// message is simply not observed by anyone.
pub struct InMemoryMessageBus {
    topics: DashMap<String, broadcast::Sender<MessageEnvelope>>,
    capacity: usize,
    max_message_bytes: usize,
    published: AtomicU64,
    rejected: AtomicU64,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_MESSAGE_BYTES)
    }

    pub fn with_limits(capacity: usize, max_message_bytes: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            max_message_bytes,
            published: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<MessageEnvelope> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Receive every envelope published to `topic` from now on.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<MessageEnvelope> {
        self.sender(topic).subscribe()
    }

    pub fn stats(&self) -> MessageBusStats {
        MessageBusStats {
            topics: self.topics.len(),
            published: self.published.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn reject(&self, error: PublishError) -> Result<(), PublishError> {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        PublishMetrics::record_rejected(error.kind());
        Err(error)
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryMessageBus {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), PublishError> {
        if envelope.topic.is_empty() {
            return self.reject(PublishError::Permanent("topic must not be empty".into()));
        }

        let size = match serde_json::to_vec(&envelope.message) {
            Ok(bytes) => bytes.len(),
            Err(e) => {
                return self.reject(PublishError::Permanent(format!("serialization failed: {}", e)))
            }
        };
        if size > self.max_message_bytes {
            return self.reject(PublishError::Permanent(format!(
                "message of {} bytes exceeds limit of {} bytes",
                size, self.max_message_bytes
            )));
        }

        let topic = envelope.topic.clone();
        let receivers = self.sender(&topic).send(envelope).unwrap_or(0);

        self.published.fetch_add(1, Ordering::Relaxed);
        PublishMetrics::record_published();
        tracing::trace!(topic = %topic, receivers, "Envelope published");
        Ok(())
    }

    fn publisher_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(topic: &str, message: serde_json::Value) -> MessageEnvelope {
        MessageEnvelope::new(topic, Some("acme".into()), message, "key-1")
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_envelope() {
        let bus = InMemoryMessageBus::new();
        let mut rx = bus.subscribe("contacts");

        bus.publish(envelope("contacts", json!({"id": 1}))).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.message, json!({"id": 1}));
        assert_eq!(received.idempotency_key(), Some("key-1"));
        assert_eq!(bus.stats().published, 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = InMemoryMessageBus::new();
        assert!(bus.publish(envelope("deals", json!({}))).await.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_message_is_permanent() {
        let bus = InMemoryMessageBus::with_limits(8, 16);
        let err = bus
            .publish(envelope("contacts", json!({"notes": "x".repeat(64)})))
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Permanent(_)));
        assert_eq!(bus.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_empty_topic_rejected() {
        let bus = InMemoryMessageBus::new();
        let err = bus.publish(envelope("", json!({}))).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Permanent);
    }
}
