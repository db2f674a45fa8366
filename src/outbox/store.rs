//! Storage contract for the transactional outbox.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::models::{
    AggregateKey, DestinationOutcome, OutboxEvent, OutboxMessage, OutboxStats,
};

/// Errors that can occur during outbox store operations.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The aggregate moved on since the caller loaded it. The whole aggregate
    /// operation must be recomputed and retried.
    #[error("Concurrency conflict on {key}: expected version {expected}, current {actual}")]
    ConcurrencyConflict {
        key: String,
        expected: i64,
        actual: i64,
    },

    #[error("Outbox message not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid outbox event: {0}")]
    InvalidEvent(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable, append-only store of domain events awaiting dispatch.
///
/// The dispatcher is the only writer of status, attempt and schedule fields.
/// Every `mark_*` operation is idempotent: applying it to a message that is
/// already terminal is a no-op.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append an event for `key`.
    ///
    /// `expected_version` must equal the aggregate's current max version
    /// (0 when the aggregate has no events yet); the new message receives
    /// `expected_version + 1`.
    async fn append(
        &self,
        key: &AggregateKey,
        event: OutboxEvent,
        expected_version: i64,
    ) -> Result<OutboxMessage, OutboxError>;

    /// Messages eligible for dispatch at `now`, ordered by aggregate and
    /// ascending version, capped at `batch_size`.
    ///
    /// Includes `Dispatching` messages whose dispatch deadline has passed so
    /// the next lease holder can reset them.
    async fn fetch_pending(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxError>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, OutboxError>;

    /// Move a waiting message to `Dispatching` with a deadline of
    /// `now + stale_after`.
    ///
    /// Returns `false` without changes when the message is not due or a lower
    /// version of the same aggregate is not terminal yet.
    async fn mark_dispatching(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool, OutboxError>;

    /// Persist the outcome of one attempt against one destination.
    async fn record_destination(
        &self,
        id: Uuid,
        destination: &str,
        outcome: DestinationOutcome,
    ) -> Result<(), OutboxError>;

    async fn mark_dispatched(&self, id: Uuid) -> Result<(), OutboxError>;

    /// Count a failed cycle and schedule the next one `backoff` from now.
    async fn mark_retry(&self, id: Uuid, backoff: Duration, error: &str) -> Result<(), OutboxError>;

    async fn mark_dead_lettered(&self, id: Uuid, error: &str) -> Result<(), OutboxError>;

    /// Return a `Dispatching` message whose deadline passed to `Pending`,
    /// counting the lost dispatch as a failed attempt.
    ///
    /// Returns `false` if the message was not stale.
    async fn reset_stale(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, OutboxError>;

    /// Acquire or extend the per-aggregate lease.
    ///
    /// Succeeds when no lease exists, the existing lease expired, or `owner`
    /// already holds it.
    async fn try_acquire_lease(
        &self,
        key: &AggregateKey,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxError>;

    /// Release the lease if `owner` still holds it.
    async fn release_lease(&self, key: &AggregateKey, owner: &str) -> Result<(), OutboxError>;

    /// Soft-archive terminal messages older than `older_than`.
    async fn archive_dispatched(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError>;

    /// Delete archived messages archived before `older_than`.
    async fn purge_archived(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError>;

    /// Most recently dead-lettered messages first.
    async fn list_dead_lettered(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxError>;
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}
