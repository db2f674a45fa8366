//! In-memory tenant cache using DashMap.
//!
//! Entries are keyed by `(tenant_id, key)`. Expiry is enforced lazily on
//! read and eagerly by `sweep_expired`, which the cache sweep task calls on
//! an interval.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::metrics::CacheMetrics;

use super::backend::{CacheEntry, CacheError, CacheStats, CachedValue, TenantCache};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tenant_id: String,
    key: String,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: CacheEntry,
    last_accessed: DateTime<Utc>,
}

impl StoredEntry {
    fn new(entry: CacheEntry) -> Self {
        Self {
            last_accessed: entry.created_at,
            entry,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if let Some(at) = self.entry.absolute_expiration {
            if at <= now {
                return true;
            }
        }
        self.entry
            .sliding_expiration
            .and_then(|idle| chrono::Duration::from_std(idle).ok())
            .and_then(|idle| self.last_accessed.checked_add_signed(idle))
            .is_some_and(|deadline| deadline <= now)
    }
}

fn validate(tenant_id: &str, key: &str) -> Result<(), CacheError> {
    if tenant_id.is_empty() || key.is_empty() {
        return Err(CacheError::InvalidKey {
            tenant_id: tenant_id.to_string(),
            key: key.to_string(),
        });
    }
    Ok(())
}

/// In-memory tenant cache.
///
/// Data is lost on restart; idempotency markers therefore only survive as
/// long as the process that wrote them.
pub struct MemoryTenantCache {
    entries: DashMap<CacheKey, StoredEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryTenantCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn key(tenant_id: &str, key: &str) -> CacheKey {
        CacheKey {
            tenant_id: tenant_id.to_string(),
            key: key.to_string(),
        }
    }

    fn miss(&self) -> Option<CachedValue> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        CacheMetrics::record_miss();
        None
    }

    fn remove_matching<F>(&self, tenant_id: &str, mut predicate: F) -> usize
    where
        F: FnMut(&CacheEntry) -> bool,
    {
        let mut removed = 0;
        self.entries.retain(|k, stored| {
            let matched = k.tenant_id == tenant_id && predicate(&stored.entry);
            if matched {
                removed += 1;
            }
            !matched
        });

        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            CacheMetrics::record_invalidated(removed);
            CacheMetrics::set_entries(self.entries.len());
        }
        removed
    }
}

impl Default for MemoryTenantCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TenantCache for MemoryTenantCache {
    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        validate(&entry.tenant_id, &entry.key)?;

        let key = Self::key(&entry.tenant_id, &entry.key);
        self.entries.insert(key, StoredEntry::new(entry));
        CacheMetrics::set_entries(self.entries.len());
        Ok(())
    }

    async fn set_if_absent(&self, entry: CacheEntry) -> Result<bool, CacheError> {
        validate(&entry.tenant_id, &entry.key)?;

        let now = Utc::now();
        let key = Self::key(&entry.tenant_id, &entry.key);
        let written = match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredEntry::new(entry));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::new(entry));
                true
            }
        };

        if written {
            CacheMetrics::set_entries(self.entries.len());
        }
        Ok(written)
    }

    async fn get(&self, tenant_id: &str, key: &str) -> Result<Option<CachedValue>, CacheError> {
        validate(tenant_id, key)?;

        let now = Utc::now();
        let cache_key = Self::key(tenant_id, key);

        let expired = match self.entries.get_mut(&cache_key) {
            None => return Ok(self.miss()),
            Some(mut stored) => {
                if stored.is_expired(now) {
                    true
                } else {
                    // Sliding expiry restarts on every hit; the absolute deadline does not move
                    stored.last_accessed = now;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    CacheMetrics::record_hit();
                    return Ok(Some(CachedValue {
                        payload: stored.entry.payload.clone(),
                        content_type: stored.entry.content_type.clone(),
                    }));
                }
            }
        };

        if expired {
            // Re-check under the shard lock so a concurrent set is not evicted
            if self
                .entries
                .remove_if(&cache_key, |_, stored| stored.is_expired(now))
                .is_some()
            {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                CacheMetrics::record_expired(1);
                tracing::trace!(tenant_id = %tenant_id, key = %key, "Evicted expired cache entry on read");
            }
        }
        Ok(self.miss())
    }

    async fn remove(&self, tenant_id: &str, key: &str) -> Result<bool, CacheError> {
        validate(tenant_id, key)?;
        let removed = self.entries.remove(&Self::key(tenant_id, key)).is_some();
        if removed {
            CacheMetrics::set_entries(self.entries.len());
        }
        Ok(removed)
    }

    async fn remove_by_tag(&self, tenant_id: &str, tag: &str) -> Result<usize, CacheError> {
        let removed = self.remove_matching(tenant_id, |entry| entry.tags.contains_key(tag));
        tracing::debug!(tenant_id = %tenant_id, tag = %tag, removed, "Invalidated cache entries by tag");
        Ok(removed)
    }

    async fn remove_by_tag_value(
        &self,
        tenant_id: &str,
        tag: &str,
        value: &str,
    ) -> Result<usize, CacheError> {
        let removed = self.remove_matching(tenant_id, |entry| {
            entry.tags.get(tag).is_some_and(|v| v == value)
        });
        tracing::debug!(
            tenant_id = %tenant_id,
            tag = %tag,
            value = %value,
            removed,
            "Invalidated cache entries by tag value"
        );
        Ok(removed)
    }

    async fn sweep_expired(&self) -> Result<usize, CacheError> {
        let now = Utc::now();
        let mut removed = 0;
        self.entries.retain(|_, stored| {
            let expired = stored.is_expired(now);
            if expired {
                removed += 1;
            }
            !expired
        });

        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            CacheMetrics::record_expired(removed);
            tracing::debug!(
                removed,
                remaining = self.entries.len(),
                "Swept expired cache entries"
            );
        }
        CacheMetrics::set_entries(self.entries.len());
        Ok(removed)
    }

    async fn stats(&self) -> CacheStats {
        let tenants: HashSet<String> = self
            .entries
            .iter()
            .map(|e| e.key().tenant_id.clone())
            .collect();

        CacheStats {
            backend_type: "memory".to_string(),
            total_entries: self.entries.len(),
            tenants: tenants.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
