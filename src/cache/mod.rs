//! Tenant-scoped cache.
//!
//! Short-lived key/value storage with absolute and sliding expiration and
//! tag-based bulk invalidation. The dispatcher uses it for delivery
//! idempotency markers.
//!
//! # Architecture
//!
//! - `TenantCache`: backend trait, every operation scoped by tenant id
//! - `MemoryTenantCache`: in-memory storage using DashMap (default)
//! - `IdempotencyStore`: delivery markers keyed by outbox message id

pub mod backend;
mod idempotency;
pub mod memory_backend;

pub use backend::{
    tenant_scope, CacheEntry, CacheError, CacheStats, CachedValue, TenantCache, PLATFORM_SCOPE,
    TENANT_SCOPE_PREFIX,
};
pub use idempotency::IdempotencyStore;
pub use memory_backend::MemoryTenantCache;
