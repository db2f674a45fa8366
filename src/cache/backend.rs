//! Backend trait for the tenant cache.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Scope used for platform-level entries that carry no tenant.
pub const PLATFORM_SCOPE: &str = "platform";

/// Prefix of every tenant scope; the platform scope never carries it.
pub const TENANT_SCOPE_PREFIX: &str = "tenant:";

/// Map an optional tenant id to its cache scope.
///
/// Tenant ids are prefixed, so no tenant id can name the platform scope.
pub fn tenant_scope(tenant_id: Option<&str>) -> String {
    match tenant_id {
        Some(tenant) => format!("{}{}", TENANT_SCOPE_PREFIX, tenant),
        None => PLATFORM_SCOPE.to_string(),
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache key must not be empty (tenant: '{tenant_id}', key: '{key}')")]
    InvalidKey { tenant_id: String, key: String },

    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),
}

/// An entry to be written to the cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub tenant_id: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    /// Hard deadline; never extended by reads
    pub absolute_expiration: Option<DateTime<Utc>>,
    /// Idle lifetime, refreshed on every hit
    pub sliding_expiration: Option<Duration>,
    pub tags: HashMap<String, String>,
}

impl CacheEntry {
    pub fn new(tenant_id: impl Into<String>, key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            key: key.into(),
            payload: payload.into(),
            content_type: "application/octet-stream".to_string(),
            created_at: Utc::now(),
            absolute_expiration: None,
            sliding_expiration: None,
            tags: HashMap::new(),
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Expire at a fixed point in time.
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    /// Expire a fixed duration after creation.
    pub fn expires_after(self, ttl: Duration) -> Self {
        let at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl));
        match at {
            Some(at) => self.expires_at(at),
            None => self,
        }
    }

    /// Expire after `idle` without reads.
    pub fn sliding(mut self, idle: Duration) -> Self {
        self.sliding_expiration = Some(idle);
        self
    }

    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }
}

/// A cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    pub payload: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub backend_type: String,
    pub total_entries: usize,
    pub tenants: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Tenant-scoped cache backend.
///
/// Every operation is scoped by tenant id; no read or write crosses tenants.
/// Mutations are atomic per key.
#[async_trait]
pub trait TenantCache: Send + Sync {
    /// Insert or replace an entry.
    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Insert an entry only if no live entry exists under the same key.
    ///
    /// Returns `true` when the entry was written.
    async fn set_if_absent(&self, entry: CacheEntry) -> Result<bool, CacheError>;

    /// Read an entry. Expired entries read as not-found and are evicted.
    async fn get(&self, tenant_id: &str, key: &str) -> Result<Option<CachedValue>, CacheError>;

    /// Remove an entry. Returns `true` if one was present.
    async fn remove(&self, tenant_id: &str, key: &str) -> Result<bool, CacheError>;

    /// Remove every entry of the tenant carrying a tag with this name.
    async fn remove_by_tag(&self, tenant_id: &str, tag: &str) -> Result<usize, CacheError>;

    /// Remove every entry of the tenant whose tag `tag` equals `value`.
    async fn remove_by_tag_value(
        &self,
        tenant_id: &str,
        tag: &str,
        value: &str,
    ) -> Result<usize, CacheError>;

    /// Evict all expired entries. Returns the number removed.
    async fn sweep_expired(&self) -> Result<usize, CacheError>;

    async fn stats(&self) -> CacheStats;
}
