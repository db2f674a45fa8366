use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::config::OutboxConfig;
use crate::outbox::{OutboxDispatcher, OutboxStore};

/// How long finished messages are kept
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Dispatched or dead-lettered messages older than this are archived
    pub archive_after: Duration,
    /// Archived messages older than this are deleted
    pub purge_after: Duration,
    /// How often the retention pass runs
    pub interval: Duration,
}

impl From<&OutboxConfig> for RetentionPolicy {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            archive_after: Duration::from_secs(config.retention_hours * 3600),
            purge_after: Duration::from_secs(config.purge_after_hours * 3600),
            interval: Duration::from_secs(config.retention_interval_seconds.max(1)),
        }
    }
}

/// Background task that runs dispatch cycles and outbox retention
pub struct OutboxPollTask {
    dispatcher: Arc<OutboxDispatcher>,
    poll_interval: Duration,
    retention: RetentionPolicy,
    shutdown: broadcast::Receiver<()>,
}

impl OutboxPollTask {
    pub fn new(
        dispatcher: Arc<OutboxDispatcher>,
        config: &OutboxConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            dispatcher,
            poll_interval: config.poll_interval().max(Duration::from_millis(10)),
            retention: RetentionPolicy::from(config),
            shutdown,
        }
    }

    /// Run until the shutdown signal arrives.
    ///
    /// A cycle starts on every poll tick and whenever the dispatcher is
    /// triggered by an append. A cycle in progress finishes before the
    /// task exits.
    pub async fn run(mut self) {
        let mut poll_timer = tokio::time::interval(self.poll_interval);
        let mut retention_timer = tokio::time::interval(self.retention.interval);
        poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Skip immediate first tick
        retention_timer.tick().await;

        let trigger = self.dispatcher.notifier();

        tracing::info!(
            worker_id = %self.dispatcher.config().worker_id,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            retention_interval_secs = self.retention.interval.as_secs(),
            "Outbox poll task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Outbox poll task received shutdown signal");
                    break;
                }
                _ = poll_timer.tick() => {
                    self.dispatcher.dispatch_pending().await;
                }
                _ = trigger.notified() => {
                    self.dispatcher.dispatch_pending().await;
                }
                _ = retention_timer.tick() => {
                    run_retention(self.dispatcher.store().as_ref(), &self.retention).await;
                }
            }
        }

        tracing::info!("Outbox poll task stopped");
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
}

/// Archive old finished messages, then purge old archived ones.
pub(crate) async fn run_retention(store: &dyn OutboxStore, policy: &RetentionPolicy) {
    let now = Utc::now();

    if let Some(archive_cutoff) = cutoff(now, policy.archive_after) {
        match store.archive_dispatched(archive_cutoff).await {
            Ok(0) => {}
            Ok(archived) => tracing::info!(archived, "Archived dispatched outbox messages"),
            Err(e) => tracing::warn!(error = %e, "Outbox archive pass failed"),
        }
    }

    if let Some(purge_cutoff) = cutoff(now, policy.purge_after) {
        match store.purge_archived(purge_cutoff).await {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, "Purged archived outbox messages"),
            Err(e) => tracing::warn!(error = %e, "Outbox purge pass failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{AggregateKey, MemoryOutboxStore, OutboxEvent, OutboxStatus};
    use serde_json::json;

    #[test]
    fn test_retention_policy_from_config() {
        let config = OutboxConfig {
            retention_hours: 2,
            purge_after_hours: 48,
            retention_interval_seconds: 0,
            ..Default::default()
        };
        let policy = RetentionPolicy::from(&config);
        assert_eq!(policy.archive_after, Duration::from_secs(7200));
        assert_eq!(policy.purge_after, Duration::from_secs(48 * 3600));
        assert_eq!(policy.interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retention_archives_then_purges() {
        let store = MemoryOutboxStore::new(3);
        let key = AggregateKey::new(Some("acme"), "deal", "9");
        let message = store
            .append(&key, OutboxEvent::new("deal.won", json!({})).to_topic("deals"), 0)
            .await
            .unwrap();
        store
            .mark_dispatching(message.id, Utc::now(), Duration::from_secs(30))
            .await
            .unwrap();
        store.mark_dispatched(message.id).await.unwrap();

        let policy = RetentionPolicy {
            archive_after: Duration::ZERO,
            purge_after: Duration::ZERO,
            interval: Duration::from_secs(1),
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        run_retention(&store, &policy).await;
        let archived = store.get(message.id).await.unwrap().unwrap();
        assert!(archived.archived_at.is_some());

        // Archived during the previous pass, so only the next pass purges it
        tokio::time::sleep(Duration::from_millis(5)).await;
        run_retention(&store, &policy).await;
        assert!(store.get(message.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retention_keeps_recent_messages() {
        let store = MemoryOutboxStore::new(3);
        let key = AggregateKey::new(None, "deal", "9");
        let message = store
            .append(&key, OutboxEvent::new("deal.won", json!({})).to_topic("deals"), 0)
            .await
            .unwrap();
        store
            .mark_dispatching(message.id, Utc::now(), Duration::from_secs(30))
            .await
            .unwrap();
        store.mark_dispatched(message.id).await.unwrap();

        run_retention(&store, &RetentionPolicy::from(&OutboxConfig::default())).await;
        let kept = store.get(message.id).await.unwrap().unwrap();
        assert_eq!(kept.status, OutboxStatus::Dispatched);
        assert!(kept.archived_at.is_none());
    }
}
