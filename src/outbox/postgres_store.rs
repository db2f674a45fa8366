//! PostgreSQL outbox store.
//!
//! The aggregate version arena is the `outbox_aggregate_versions` table; the
//! version check is one conditional upsert, so an append issued through
//! [`PostgresOutboxStore::append_in_tx`] commits or rolls back together with
//! the aggregate's own state write.
//!
//! Tables:
//! - `outbox_aggregate_versions` - current max version per aggregate
//! - `outbox_messages` - messages with JSONB payload and destination state
//! - `outbox_leases` - per-aggregate dispatch leases

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::cache::tenant_scope;
use crate::metrics::OutboxMetrics;

use super::models::{
    AggregateKey, Destination, DestinationOutcome, DestinationState, OutboxEvent, OutboxMessage,
    OutboxStats, OutboxStatus,
};
use super::store::{chrono_duration, OutboxError, OutboxStore};

/// DDL applied by `PostgresPool::ensure_schema`.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_aggregate_versions (
    tenant_scope TEXT NOT NULL,
    aggregate_type TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    version BIGINT NOT NULL,
    PRIMARY KEY (tenant_scope, aggregate_type, aggregate_id)
);
CREATE TABLE IF NOT EXISTS outbox_messages (
    id UUID PRIMARY KEY,
    tenant_scope TEXT NOT NULL,
    tenant_id TEXT,
    aggregate_type TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    aggregate_version BIGINT NOT NULL,
    event_type TEXT NOT NULL,
    payload JSONB NOT NULL,
    occurred_at TIMESTAMPTZ NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    next_attempt_at TIMESTAMPTZ NOT NULL,
    last_error TEXT,
    destinations JSONB NOT NULL,
    destination_states JSONB NOT NULL,
    dispatched_at TIMESTAMPTZ,
    archived_at TIMESTAMPTZ,
    UNIQUE (tenant_scope, aggregate_type, aggregate_id, aggregate_version)
);
CREATE INDEX IF NOT EXISTS idx_outbox_messages_due
    ON outbox_messages (next_attempt_at)
    WHERE archived_at IS NULL AND status IN ('pending', 'failed', 'dispatching');
CREATE INDEX IF NOT EXISTS idx_outbox_messages_dead
    ON outbox_messages (dispatched_at DESC)
    WHERE status = 'dead_lettered';
CREATE TABLE IF NOT EXISTS outbox_leases (
    tenant_scope TEXT NOT NULL,
    aggregate_type TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    owner TEXT NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (tenant_scope, aggregate_type, aggregate_id)
);
"#;

const MESSAGE_COLUMNS: &str = "id, tenant_id, aggregate_type, aggregate_id, aggregate_version, \
     event_type, payload, occurred_at, status, attempts, max_attempts, next_attempt_at, \
     last_error, destinations, destination_states, dispatched_at, archived_at";

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    tenant_id: Option<String>,
    aggregate_type: String,
    aggregate_id: String,
    aggregate_version: i64,
    event_type: String,
    payload: serde_json::Value,
    occurred_at: DateTime<Utc>,
    status: String,
    attempts: i32,
    max_attempts: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    destinations: serde_json::Value,
    destination_states: serde_json::Value,
    dispatched_at: Option<DateTime<Utc>>,
    archived_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxMessage {
    type Error = OutboxError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status = OutboxStatus::parse(&row.status).ok_or_else(|| {
            OutboxError::InvalidEvent(format!("unknown status '{}' on {}", row.status, row.id))
        })?;
        let destinations: Vec<Destination> = serde_json::from_value(row.destinations)?;
        let destination_states: Vec<DestinationState> =
            serde_json::from_value(row.destination_states)?;

        Ok(OutboxMessage {
            id: row.id,
            tenant_id: row.tenant_id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            aggregate_version: row.aggregate_version,
            event_type: row.event_type,
            payload: row.payload,
            occurred_at: row.occurred_at,
            status,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            destinations,
            destination_states,
            dispatched_at: row.dispatched_at,
            archived_at: row.archived_at,
        })
    }
}

fn into_messages(rows: Vec<OutboxRow>) -> Result<Vec<OutboxMessage>, OutboxError> {
    rows.into_iter().map(OutboxMessage::try_from).collect()
}

/// PostgreSQL-backed outbox store.
pub struct PostgresOutboxStore {
    pool: PgPool,
    default_max_attempts: u32,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool, default_max_attempts: u32) -> Self {
        Self {
            pool,
            default_max_attempts,
        }
    }

    /// Append inside the caller's transaction.
    ///
    /// Nothing becomes visible to the dispatcher unless the caller commits.
    pub async fn append_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &AggregateKey,
        event: OutboxEvent,
        expected_version: i64,
    ) -> Result<OutboxMessage, OutboxError> {
        if event.event_type.is_empty() {
            return Err(OutboxError::InvalidEvent("event_type must not be empty".into()));
        }
        let scope = tenant_scope(key.tenant_id.as_deref());

        // Compare-and-swap on the version arena: the insert branch only runs
        // for a brand-new aggregate, the update branch only on a version match
        let bumped: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO outbox_aggregate_versions (tenant_scope, aggregate_type, aggregate_id, version)
            SELECT $1, $2, $3, $4 + 1
            WHERE $4 = 0 OR EXISTS (
                SELECT 1 FROM outbox_aggregate_versions
                WHERE tenant_scope = $1 AND aggregate_type = $2 AND aggregate_id = $3
            )
            ON CONFLICT (tenant_scope, aggregate_type, aggregate_id) DO UPDATE
            SET version = EXCLUDED.version
            WHERE outbox_aggregate_versions.version = $4
            RETURNING version
            "#,
        )
        .bind(&scope)
        .bind(&key.aggregate_type)
        .bind(&key.aggregate_id)
        .bind(expected_version)
        .fetch_optional(&mut **tx)
        .await?;

        let Some((version,)) = bumped else {
            let actual: Option<(i64,)> = sqlx::query_as(
                r#"
                SELECT version FROM outbox_aggregate_versions
                WHERE tenant_scope = $1 AND aggregate_type = $2 AND aggregate_id = $3
                "#,
            )
            .bind(&scope)
            .bind(&key.aggregate_type)
            .bind(&key.aggregate_id)
            .fetch_optional(&mut **tx)
            .await?;

            OutboxMetrics::record_conflict();
            return Err(OutboxError::ConcurrencyConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: actual.map(|(v,)| v).unwrap_or(0),
            });
        };

        let message = OutboxMessage::new(key, version, event, self.default_max_attempts);

        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id, tenant_scope, tenant_id, aggregate_type, aggregate_id, aggregate_version,
                event_type, payload, occurred_at, status, attempts, max_attempts,
                next_attempt_at, destinations, destination_states
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, $11, $12, $13, $14)
            "#,
        )
        .bind(message.id)
        .bind(&scope)
        .bind(&message.tenant_id)
        .bind(&message.aggregate_type)
        .bind(&message.aggregate_id)
        .bind(message.aggregate_version)
        .bind(&message.event_type)
        .bind(&message.payload)
        .bind(message.occurred_at)
        .bind(message.status.as_str())
        .bind(message.max_attempts as i32)
        .bind(message.next_attempt_at)
        .bind(serde_json::to_value(&message.destinations)?)
        .bind(serde_json::to_value(&message.destination_states)?)
        .execute(&mut **tx)
        .await?;

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

    async fn ensure_exists(&self, id: Uuid) -> Result<(), OutboxError> {
        let found: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM outbox_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        found.map(|_| ()).ok_or(OutboxError::NotFound(id))
    }

    /// Run a terminal-guarded update; zero rows means already terminal or missing.
    async fn guarded_update(&self, id: Uuid, rows_affected: u64) -> Result<(), OutboxError> {
        if rows_affected == 0 {
            self.ensure_exists(id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn append(
        &self,
        key: &AggregateKey,
        event: OutboxEvent,
        expected_version: i64,
    ) -> Result<OutboxMessage, OutboxError> {
        let mut tx = self.pool.begin().await?;
        let message = self.append_in_tx(&mut tx, key, event, expected_version).await?;
        tx.commit().await?;
        Ok(message)
    }

    async fn fetch_pending(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        // Rows behind a predecessor that is in backoff or in flight are left
        // out so they cannot crowd other aggregates out of the batch. The
        // ordering matches `AggregateKey`'s `Ord` (tenant, type, id).
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM outbox_messages m
            WHERE m.archived_at IS NULL
              AND m.next_attempt_at <= $1
              AND m.status IN ('pending', 'failed', 'dispatching')
              AND NOT EXISTS (
                  SELECT 1 FROM outbox_messages p
                  WHERE p.tenant_scope = m.tenant_scope
                    AND p.aggregate_type = m.aggregate_type
                    AND p.aggregate_id = m.aggregate_id
                    AND p.aggregate_version < m.aggregate_version
                    AND p.status NOT IN ('dispatched', 'dead_lettered')
                    AND p.next_attempt_at > $1
              )
            ORDER BY m.tenant_id COLLATE "C" ASC NULLS FIRST,
                     m.aggregate_type COLLATE "C",
                     m.aggregate_id COLLATE "C",
                     m.aggregate_version
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        into_messages(rows)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, OutboxError> {
        let row: Option<OutboxRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbox_messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OutboxMessage::try_from).transpose()
    }

    async fn mark_dispatching(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool, OutboxError> {
        // Ordering barrier: no lower version of the aggregate may be non-terminal
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages m
            SET status = 'dispatching', next_attempt_at = $3
            WHERE m.id = $1
              AND m.status IN ('pending', 'failed')
              AND m.next_attempt_at <= $2
              AND NOT EXISTS (
                  SELECT 1 FROM outbox_messages p
                  WHERE p.tenant_scope = m.tenant_scope
                    AND p.aggregate_type = m.aggregate_type
                    AND p.aggregate_id = m.aggregate_id
                    AND p.aggregate_version < m.aggregate_version
                    AND p.status NOT IN ('dispatched', 'dead_lettered')
              )
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now + chrono_duration(stale_after))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.ensure_exists(id).await?;
        Ok(false)
    }

    async fn record_destination(
        &self,
        id: Uuid,
        destination: &str,
        outcome: DestinationOutcome,
    ) -> Result<(), OutboxError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<OutboxRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbox_messages WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let mut message = row
            .map(OutboxMessage::try_from)
            .transpose()?
            .ok_or(OutboxError::NotFound(id))?;
        if message.status.is_terminal() {
            return Ok(());
        }

        message.record_destination(destination, &outcome);
        sqlx::query("UPDATE outbox_messages SET destination_states = $2 WHERE id = $1")
            .bind(id)
            .bind(serde_json::to_value(&message.destination_states)?)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_dispatched(&self, id: Uuid) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'dispatched', dispatched_at = NOW(), last_error = NULL
            WHERE id = $1 AND status NOT IN ('dispatched', 'dead_lettered')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.guarded_update(id, result.rows_affected()).await
    }

    async fn mark_retry(&self, id: Uuid, backoff: Duration, error: &str) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'failed', attempts = attempts + 1, next_attempt_at = $2, last_error = $3
            WHERE id = $1 AND status NOT IN ('dispatched', 'dead_lettered')
            "#,
        )
        .bind(id)
        .bind(Utc::now() + chrono_duration(backoff))
        .bind(error)
        .execute(&self.pool)
        .await?;

        self.guarded_update(id, result.rows_affected()).await
    }

    async fn mark_dead_lettered(&self, id: Uuid, error: &str) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'dead_lettered', dispatched_at = NOW(), last_error = $2
            WHERE id = $1 AND status NOT IN ('dispatched', 'dead_lettered')
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        self.guarded_update(id, result.rows_affected()).await
    }

    async fn reset_stale(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'pending',
                attempts = attempts + 1,
                next_attempt_at = $2,
                last_error = 'dispatch lease expired before completion'
            WHERE id = $1 AND status = 'dispatching' AND next_attempt_at <= $2
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn try_acquire_lease(
        &self,
        key: &AggregateKey,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxError> {
        // Single conditional write: a held, unexpired lease of another owner
        // leaves the row untouched and affects zero rows
        let result = sqlx::query(
            r#"
            INSERT INTO outbox_leases (tenant_scope, aggregate_type, aggregate_id, owner, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_scope, aggregate_type, aggregate_id) DO UPDATE
            SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
            WHERE outbox_leases.expires_at <= $6 OR outbox_leases.owner = EXCLUDED.owner
            "#,
        )
        .bind(tenant_scope(key.tenant_id.as_deref()))
        .bind(&key.aggregate_type)
        .bind(&key.aggregate_id)
        .bind(owner)
        .bind(now + chrono_duration(ttl))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, key: &AggregateKey, owner: &str) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            DELETE FROM outbox_leases
            WHERE tenant_scope = $1 AND aggregate_type = $2 AND aggregate_id = $3 AND owner = $4
            "#,
        )
        .bind(tenant_scope(key.tenant_id.as_deref()))
        .bind(&key.aggregate_type)
        .bind(&key.aggregate_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn archive_dispatched(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages SET archived_at = NOW()
            WHERE archived_at IS NULL
              AND status IN ('dispatched', 'dead_lettered')
              AND dispatched_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn purge_archived(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError> {
        let result = sqlx::query("DELETE FROM outbox_messages WHERE archived_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn list_dead_lettered(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM outbox_messages
            WHERE status = 'dead_lettered' AND archived_at IS NULL
            ORDER BY dispatched_at DESC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        into_messages(rows)
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let counts: Vec<(String, bool, i64)> = sqlx::query_as(
            r#"
            SELECT status, archived_at IS NOT NULL AS archived, COUNT(*)
            FROM outbox_messages
            GROUP BY 1, 2
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let (active_leases,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox_leases WHERE expires_at > NOW()")
                .fetch_one(&self.pool)
                .await?;

        let mut stats = OutboxStats {
            backend_type: "postgres".to_string(),
            active_leases: active_leases as usize,
            ..Default::default()
        };

        for (status, archived, count) in counts {
            let count = count as usize;
            if archived {
                stats.archived += count;
                continue;
            }
            match OutboxStatus::parse(&status) {
                Some(OutboxStatus::Pending) => stats.pending += count,
                Some(OutboxStatus::Dispatching) => stats.dispatching += count,
                Some(OutboxStatus::Failed) => stats.failed += count,
                Some(OutboxStatus::Dispatched) => stats.dispatched += count,
                Some(OutboxStatus::DeadLettered) => stats.dead_lettered += count,
                None => tracing::warn!(status = %status, "Unknown outbox status in stats"),
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_splits_into_statements() {
        let statements: Vec<&str> = SCHEMA
            .split(";\n")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        assert_eq!(statements.len(), 5);
        assert!(statements.iter().all(|s| s.starts_with("CREATE")));
    }

    #[test]
    fn test_row_conversion() {
        let row = OutboxRow {
            id: Uuid::new_v4(),
            tenant_id: Some("acme".into()),
            aggregate_type: "contact".into(),
            aggregate_id: "1".into(),
            aggregate_version: 3,
            event_type: "contact.updated".into(),
            payload: serde_json::json!({"n": 3}),
            occurred_at: Utc::now(),
            status: "failed".into(),
            attempts: 2,
            max_attempts: 5,
            next_attempt_at: Utc::now(),
            last_error: Some("HTTP 503".into()),
            destinations: serde_json::json!([{"kind": "bus", "topic": "contacts"}]),
            destination_states: serde_json::json!([
                {"name": "bus:contacts", "attempts": 2, "acknowledged": false}
            ]),
            dispatched_at: None,
            archived_at: None,
        };

        let message = OutboxMessage::try_from(row).unwrap();
        assert_eq!(message.status, OutboxStatus::Failed);
        assert_eq!(message.attempts, 2);
        assert_eq!(message.destinations, vec![Destination::bus("contacts")]);
        assert_eq!(message.destination_states[0].attempts, 2);
    }

    #[test]
    fn test_unknown_status_rejected() {
        let row = OutboxRow {
            id: Uuid::new_v4(),
            tenant_id: None,
            aggregate_type: "deal".into(),
            aggregate_id: "1".into(),
            aggregate_version: 1,
            event_type: "deal.won".into(),
            payload: serde_json::json!({}),
            occurred_at: Utc::now(),
            status: "lost".into(),
            attempts: 0,
            max_attempts: 1,
            next_attempt_at: Utc::now(),
            last_error: None,
            destinations: serde_json::json!([]),
            destination_states: serde_json::json!([]),
            dispatched_at: None,
            archived_at: None,
        };
        assert!(matches!(
            OutboxMessage::try_from(row),
            Err(OutboxError::InvalidEvent(_))
        ));
    }
}
