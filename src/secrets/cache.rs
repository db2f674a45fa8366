//! TTL cache in front of a secret provider.
//!
//! Signing keys are resolved per key id on every sign/verify call; the cache
//! bounds how often the backing provider is hit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use super::{SecretError, SecretProvider, SecretValue};

#[derive(Debug, Clone)]
struct CachedSecret {
    secret: SecretValue,
    expires_at: DateTime<Utc>,
}

/// Cache statistics for health reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SecretCacheStats {
    pub total_count: usize,
    pub expired_count: usize,
}

/// A `SecretProvider` wrapper that adds TTL-based caching to any inner provider.
pub struct CachedSecretProvider {
    inner: Arc<dyn SecretProvider>,
    entries: RwLock<HashMap<String, CachedSecret>>,
    ttl: Duration,
}

impl CachedSecretProvider {
    pub fn new(inner: Arc<dyn SecretProvider>, ttl_seconds: u64) -> Self {
        Self {
            inner,
            entries: RwLock::new(HashMap::new()),
            ttl: Duration::seconds(ttl_seconds as i64),
        }
    }

    pub fn inner(&self) -> &Arc<dyn SecretProvider> {
        &self.inner
    }

    /// Drop a cached entry so the next read goes to the provider.
    pub async fn invalidate(&self, name: &str) {
        self.entries.write().await.remove(name);
    }

    pub async fn clear_expired(&self) {
        let now = Utc::now();
        self.entries
            .write()
            .await
            .retain(|_, cached| cached.expires_at > now);
    }

    pub async fn stats(&self) -> SecretCacheStats {
        let now = Utc::now();
        let entries = self.entries.read().await;
        SecretCacheStats {
            total_count: entries.len(),
            expired_count: entries.values().filter(|c| c.expires_at <= now).count(),
        }
    }

    async fn store(&self, secret: SecretValue) {
        let cached = CachedSecret {
            expires_at: Utc::now() + self.ttl,
            secret,
        };
        self.entries
            .write()
            .await
            .insert(cached.secret.name.clone(), cached);
    }
}

impl std::fmt::Debug for CachedSecretProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedSecretProvider")
            .field("provider_type", &self.inner.provider_type())
            .field("ttl_seconds", &self.ttl.num_seconds())
            .finish()
    }
}

#[async_trait]
impl SecretProvider for CachedSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretValue, SecretError> {
        {
            let entries = self.entries.read().await;
            if let Some(cached) = entries.get(name) {
                if Utc::now() < cached.expires_at {
                    tracing::trace!(secret_name = name, "Secret cache hit");
                    return Ok(cached.secret.clone());
                }
            }
        }

        let secret = self.inner.get_secret(name).await?;
        self.store(secret.clone()).await;
        Ok(secret)
    }

    async fn rotate_secret(
        &self,
        name: &str,
        next_value: &(dyn for<'a> Fn(Option<&'a SecretValue>) -> Vec<u8> + Send + Sync),
    ) -> Result<SecretValue, SecretError> {
        self.invalidate(name).await;
        let rotated = self.inner.rotate_secret(name, next_value).await?;
        self.store(rotated.clone()).await;
        Ok(rotated)
    }

    fn provider_type(&self) -> &'static str {
        self.inner.provider_type()
    }
}
