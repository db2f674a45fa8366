//! Delivery markers backed by the tenant cache.
//!
//! A marker records that one destination of one outbox message has been
//! acknowledged, so a re-dispatch after a crash or lease takeover does not
//! deliver to it again.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::backend::{tenant_scope, CacheEntry, TenantCache};

const MESSAGE_TAG: &str = "outbox_message";

pub struct IdempotencyStore {
    cache: Arc<dyn TenantCache>,
    ttl: Duration,
}

impl IdempotencyStore {
    /// `ttl` must cover the full retry horizon of a message.
    pub fn new(cache: Arc<dyn TenantCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(message_id: Uuid, destination: &str) -> String {
        format!("outbox:{}:{}", message_id, destination)
    }

    /// Whether `destination` already acknowledged `message_id`.
    ///
    /// Cache errors read as "not delivered"; the destination then sees the
    /// message again and must deduplicate on the idempotency key.
    pub async fn is_delivered(
        &self,
        tenant_id: Option<&str>,
        message_id: Uuid,
        destination: &str,
    ) -> bool {
        let key = Self::key(message_id, destination);
        match self.cache.get(&tenant_scope(tenant_id), &key).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                tracing::warn!(message_id = %message_id, error = %e, "Idempotency lookup failed");
                false
            }
        }
    }

    /// Record an acknowledged delivery. Returns `true` if the marker is new.
    pub async fn mark_delivered(
        &self,
        tenant_id: Option<&str>,
        message_id: Uuid,
        destination: &str,
    ) -> bool {
        let entry = CacheEntry::new(
            tenant_scope(tenant_id),
            Self::key(message_id, destination),
            destination.as_bytes().to_vec(),
        )
        .content_type("text/plain")
        .expires_after(self.ttl)
        .tag(MESSAGE_TAG, message_id.to_string());

        match self.cache.set_if_absent(entry).await {
            Ok(written) => written,
            Err(e) => {
                tracing::warn!(message_id = %message_id, error = %e, "Failed to write idempotency marker");
                false
            }
        }
    }

    /// Drop every marker of a message.
    pub async fn forget(&self, tenant_id: Option<&str>, message_id: Uuid) -> usize {
        self.cache
            .remove_by_tag_value(&tenant_scope(tenant_id), MESSAGE_TAG, &message_id.to_string())
            .await
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryTenantCache;

    fn store() -> IdempotencyStore {
        IdempotencyStore::new(Arc::new(MemoryTenantCache::new()), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_mark_then_check() {
        let store = store();
        let id = Uuid::new_v4();

        assert!(!store.is_delivered(Some("acme"), id, "bus:contacts").await);
        assert!(store.mark_delivered(Some("acme"), id, "bus:contacts").await);
        assert!(!store.mark_delivered(Some("acme"), id, "bus:contacts").await);
        assert!(store.is_delivered(Some("acme"), id, "bus:contacts").await);

        // Other destinations and tenants are unaffected
        assert!(!store.is_delivered(Some("acme"), id, "webhook:https://x").await);
        assert!(!store.is_delivered(Some("globex"), id, "bus:contacts").await);
    }

    #[tokio::test]
    async fn test_platform_scope_and_forget() {
        let store = store();
        let id = Uuid::new_v4();

        store.mark_delivered(None, id, "a").await;
        store.mark_delivered(None, id, "b").await;
        assert!(store.is_delivered(None, id, "a").await);

        assert_eq!(store.forget(None, id).await, 2);
        assert!(!store.is_delivered(None, id, "a").await);
    }

    #[tokio::test]
    async fn test_tenant_named_like_platform_scope_is_isolated() {
        let store = store();
        let id = Uuid::new_v4();

        store.mark_delivered(None, id, "bus:contacts").await;
        assert!(!store.is_delivered(Some("platform"), id, "bus:contacts").await);
        assert!(!store.is_delivered(Some("_platform"), id, "bus:contacts").await);

        store.mark_delivered(Some("platform"), id, "bus:deals").await;
        assert!(!store.is_delivered(None, id, "bus:deals").await);
    }
}
