//! In-memory outbox store.
//!
//! Messages, the per-aggregate version arena and the aggregate index share
//! one mutex so the version check and the insert commit together. Leases
//! live in a `DashMap` and are acquired with a single conditional entry
//! write. Data is lost on restart.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::metrics::OutboxMetrics;

use super::models::{
    AggregateKey, DestinationOutcome, OutboxEvent, OutboxMessage, OutboxStats, OutboxStatus,
};
use super::store::{chrono_duration, OutboxError, OutboxStore};

#[derive(Default)]
struct Tables {
    messages: HashMap<Uuid, OutboxMessage>,
    /// Aggregate key -> current max version
    versions: HashMap<AggregateKey, i64>,
    /// Aggregate key -> message ids in version order
    by_aggregate: HashMap<AggregateKey, Vec<Uuid>>,
}

impl Tables {
    fn message_mut(&mut self, id: Uuid) -> Result<&mut OutboxMessage, OutboxError> {
        self.messages.get_mut(&id).ok_or(OutboxError::NotFound(id))
    }

    /// True when every lower version of the message's aggregate is terminal.
    fn barrier_clear(&self, message: &OutboxMessage) -> bool {
        let key = message.aggregate_key();
        self.by_aggregate
            .get(&key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.messages.get(id))
                    .filter(|m| m.aggregate_version < message.aggregate_version)
                    .all(|m| m.status.is_terminal())
            })
            .unwrap_or(true)
    }

    /// True when every non-terminal lower version of the message's aggregate
    /// is itself due at `now`. Rows behind a predecessor in backoff or in
    /// flight elsewhere cannot dispatch this cycle and are left out of the batch.
    fn predecessors_due(&self, message: &OutboxMessage, now: DateTime<Utc>) -> bool {
        let key = message.aggregate_key();
        self.by_aggregate
            .get(&key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.messages.get(id))
                    .filter(|m| m.aggregate_version < message.aggregate_version)
                    .all(|m| m.status.is_terminal() || m.next_attempt_at <= now)
            })
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// In-memory outbox store.
pub struct MemoryOutboxStore {
    tables: Mutex<Tables>,
    leases: DashMap<AggregateKey, Lease>,
    default_max_attempts: u32,
}

impl MemoryOutboxStore {
    pub fn new(default_max_attempts: u32) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            leases: DashMap::new(),
            default_max_attempts,
        }
    }

    /// Current max version of an aggregate (0 when it has no events).
    pub async fn current_version(&self, key: &AggregateKey) -> i64 {
        self.tables.lock().await.versions.get(key).copied().unwrap_or(0)
    }

    /// Current lease owner, if the lease is live.
    pub fn lease_owner(&self, key: &AggregateKey, now: DateTime<Utc>) -> Option<String> {
        self.leases
            .get(key)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.owner.clone())
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn append(
        &self,
        key: &AggregateKey,
        event: OutboxEvent,
        expected_version: i64,
    ) -> Result<OutboxMessage, OutboxError> {
        if event.event_type.is_empty() {
            return Err(OutboxError::InvalidEvent("event_type must not be empty".into()));
        }

        let mut tables = self.tables.lock().await;

        let current = tables.versions.get(key).copied().unwrap_or(0);
        if current != expected_version {
            OutboxMetrics::record_conflict();
            return Err(OutboxError::ConcurrencyConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: current,
            });
        }

        let version = current + 1;
        let message = OutboxMessage::new(key, version, event, self.default_max_attempts);

        tables.versions.insert(key.clone(), version);
        tables
            .by_aggregate
            .entry(key.clone())
            .or_default()
            .push(message.id);
        tables.messages.insert(message.id, message.clone());
        drop(tables);

        OutboxMetrics::record_appended();
        tracing::debug!(
            message_id = %message.id,
            aggregate = %key,
            version,
            event_type = %message.event_type,
            "Event appended to outbox"
        );

        Ok(message)
    }

    async fn fetch_pending(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        let tables = self.tables.lock().await;

        let mut due: Vec<&OutboxMessage> = tables
            .messages
            .values()
            .filter(|m| m.archived_at.is_none() && m.next_attempt_at <= now)
            .filter(|m| m.status.is_waiting() || m.status == OutboxStatus::Dispatching)
            .filter(|m| tables.predecessors_due(m, now))
            .collect();

        // Same field order as `AggregateKey`'s `Ord`, then version
        due.sort_by(|a, b| {
            (&a.tenant_id, &a.aggregate_type, &a.aggregate_id, a.aggregate_version).cmp(&(
                &b.tenant_id,
                &b.aggregate_type,
                &b.aggregate_id,
                b.aggregate_version,
            ))
        });

        Ok(due.into_iter().take(batch_size).cloned().collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, OutboxError> {
        Ok(self.tables.lock().await.messages.get(&id).cloned())
    }

    async fn mark_dispatching(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool, OutboxError> {
        let mut tables = self.tables.lock().await;

        let message = tables
            .messages
            .get(&id)
            .ok_or(OutboxError::NotFound(id))?;
        if !message.status.is_waiting() || message.next_attempt_at > now {
            return Ok(false);
        }
        if !tables.barrier_clear(message) {
            return Ok(false);
        }

        let message = tables.message_mut(id)?;
        message.status = OutboxStatus::Dispatching;
        message.next_attempt_at = now + chrono_duration(stale_after);
        Ok(true)
    }

    async fn record_destination(
        &self,
        id: Uuid,
        destination: &str,
        outcome: DestinationOutcome,
    ) -> Result<(), OutboxError> {
        let mut tables = self.tables.lock().await;
        let message = tables.message_mut(id)?;
        if !message.status.is_terminal() {
            message.record_destination(destination, &outcome);
        }
        Ok(())
    }

    async fn mark_dispatched(&self, id: Uuid) -> Result<(), OutboxError> {
        let mut tables = self.tables.lock().await;
        let message = tables.message_mut(id)?;
        if message.status.is_terminal() {
            return Ok(());
        }
        message.status = OutboxStatus::Dispatched;
        message.dispatched_at = Some(Utc::now());
        message.last_error = None;
        Ok(())
    }

    async fn mark_retry(&self, id: Uuid, backoff: Duration, error: &str) -> Result<(), OutboxError> {
        let mut tables = self.tables.lock().await;
        let message = tables.message_mut(id)?;
        if message.status.is_terminal() {
            return Ok(());
        }
        message.status = OutboxStatus::Failed;
        message.attempts += 1;
        message.next_attempt_at = Utc::now() + chrono_duration(backoff);
        message.last_error = Some(error.to_string());
        Ok(())
    }

    async fn mark_dead_lettered(&self, id: Uuid, error: &str) -> Result<(), OutboxError> {
        let mut tables = self.tables.lock().await;
        let message = tables.message_mut(id)?;
        if message.status.is_terminal() {
            return Ok(());
        }
        message.status = OutboxStatus::DeadLettered;
        message.last_error = Some(error.to_string());
        message.dispatched_at = Some(Utc::now());
        Ok(())
    }

    async fn reset_stale(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, OutboxError> {
        let mut tables = self.tables.lock().await;
        let message = tables.message_mut(id)?;
        if message.status != OutboxStatus::Dispatching || message.next_attempt_at > now {
            return Ok(false);
        }
        message.status = OutboxStatus::Pending;
        message.attempts += 1;
        message.next_attempt_at = now;
        message.last_error = Some("dispatch lease expired before completion".to_string());
        Ok(true)
    }

    async fn try_acquire_lease(
        &self,
        key: &AggregateKey,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxError> {
        let lease = Lease {
            owner: owner.to_string(),
            expires_at: now + chrono_duration(ttl),
        };

        let acquired = match self.leases.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.expires_at <= now || current.owner == owner {
                    occupied.insert(lease);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lease);
                true
            }
        };
        Ok(acquired)
    }

    async fn release_lease(&self, key: &AggregateKey, owner: &str) -> Result<(), OutboxError> {
        self.leases.remove_if(key, |_, lease| lease.owner == owner);
        Ok(())
    }

    async fn archive_dispatched(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        let mut archived = 0;
        for message in tables.messages.values_mut() {
            let done_before_cutoff = message.dispatched_at.is_some_and(|at| at < older_than);
            if message.status.is_terminal() && message.archived_at.is_none() && done_before_cutoff {
                message.archived_at = Some(now);
                archived += 1;
            }
        }
        Ok(archived)
    }

    async fn purge_archived(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError> {
        let mut tables = self.tables.lock().await;

        let purge: Vec<Uuid> = tables
            .messages
            .values()
            .filter(|m| m.archived_at.is_some_and(|at| at < older_than))
            .map(|m| m.id)
            .collect();

        for id in &purge {
            if let Some(message) = tables.messages.remove(id) {
                let key = message.aggregate_key();
                if let Some(ids) = tables.by_aggregate.get_mut(&key) {
                    ids.retain(|other| other != id);
                    if ids.is_empty() {
                        tables.by_aggregate.remove(&key);
                    }
                }
            }
        }
        Ok(purge.len())
    }

    async fn list_dead_lettered(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError> {
        let tables = self.tables.lock().await;
        let mut dead: Vec<&OutboxMessage> = tables
            .messages
            .values()
            .filter(|m| m.status == OutboxStatus::DeadLettered && m.archived_at.is_none())
            .collect();
        dead.sort_by(|a, b| b.dispatched_at.cmp(&a.dispatched_at));
        Ok(dead.into_iter().take(limit).cloned().collect())
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let now = Utc::now();
        let tables = self.tables.lock().await;
        let mut stats = OutboxStats {
            backend_type: "memory".to_string(),
            active_leases: self
                .leases
                .iter()
                .filter(|lease| lease.expires_at > now)
                .count(),
            ..Default::default()
        };

        for message in tables.messages.values() {
            if message.archived_at.is_some() {
                stats.archived += 1;
                continue;
            }
            match message.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Dispatching => stats.dispatching += 1,
                OutboxStatus::Failed => stats.failed += 1,
                OutboxStatus::Dispatched => stats.dispatched += 1,
                OutboxStatus::DeadLettered => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }
}
