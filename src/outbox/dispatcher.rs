//! Outbox dispatcher.
//!
//! One cycle fetches a batch, groups it by aggregate and drives each group
//! under a per-aggregate lease, strictly in version order. Groups run in
//! parallel up to the configured concurrency. A transient failure stops the
//! group for this cycle; higher versions wait until the failed message's
//! backoff expires.
//!
//! Delivery of one message must finish while the lease taken or renewed for
//! it is still live: destinations share a budget of 80% of the lease TTL and
//! a destination reached after the budget is spent is failed transiently
//! without being called.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::cache::IdempotencyStore;
use crate::config::OutboxConfig;
use crate::error::FailureKind;
use crate::metrics::OutboxMetrics;
use crate::publisher::{idempotency_key_for, MessageEnvelope, MessagePublisher};
use crate::secrets::{SecretError, SecretProvider};
use crate::webhook::WebhookDispatcher;

use super::alerting::{DeadLetterAlert, DeadLetterAlerter};
use super::models::{
    AggregateKey, Destination, DestinationOutcome, OutboxEvent, OutboxMessage, OutboxStatus,
};
use super::store::{OutboxError, OutboxStore};

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Lease owner token
    pub worker_id: String,
    pub batch_size: usize,
    /// Aggregate groups processed in parallel
    pub concurrency: usize,
    /// Lease lifetime; also the deadline after which `Dispatching` is stale
    pub lease_ttl: Duration,
    /// Upper bound for one call to one destination
    pub attempt_timeout: Duration,
}

impl DispatcherConfig {
    /// Time all destinations of one message may take together.
    pub fn delivery_budget(&self) -> Duration {
        self.lease_ttl.saturating_sub(self.lease_ttl / 5)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&OutboxConfig::default())
    }
}

impl From<&OutboxConfig> for DispatcherConfig {
    fn from(config: &OutboxConfig) -> Self {
        let worker_id = if config.worker_id.is_empty() {
            format!("relay-{}", Uuid::new_v4().simple())
        } else {
            config.worker_id.clone()
        };

        Self {
            worker_id,
            batch_size: config.batch_size.max(1),
            concurrency: config.concurrency.max(1),
            lease_ttl: config.lease_ttl(),
            attempt_timeout: config.attempt_timeout(),
        }
    }
}

/// Collaborators injected into the dispatcher.
pub struct DispatcherDeps {
    pub store: Arc<dyn OutboxStore>,
    pub publisher: Arc<dyn MessagePublisher>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub secrets: Arc<dyn SecretProvider>,
    pub idempotency: Arc<IdempotencyStore>,
    pub alerter: Arc<dyn DeadLetterAlerter>,
    pub backoff: BackoffPolicy,
}

/// Outcome of one dispatch cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub fetched: usize,
    pub groups: usize,
    pub dispatched: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Messages left for a later cycle behind a failed or unfinished lower version
    pub skipped_by_barrier: usize,
    /// Groups skipped because another worker held the lease
    pub lease_contended: usize,
    pub stale_reset: usize,
    pub errors: usize,
}

impl DispatchReport {
    fn merge(&mut self, other: &DispatchReport) {
        self.dispatched += other.dispatched;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.skipped_by_barrier += other.skipped_by_barrier;
        self.lease_contended += other.lease_contended;
        self.stale_reset += other.stale_reset;
        self.errors += other.errors;
    }
}

/// Running totals across cycles
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub cycles: AtomicU64,
    pub dispatched: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub lease_contended: AtomicU64,
    pub stale_reset: AtomicU64,
    pub errors: AtomicU64,
}

impl DispatcherStats {
    fn record(&self, report: &DispatchReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.dispatched
            .fetch_add(report.dispatched as u64, Ordering::Relaxed);
        self.retried.fetch_add(report.retried as u64, Ordering::Relaxed);
        self.dead_lettered
            .fetch_add(report.dead_lettered as u64, Ordering::Relaxed);
        self.lease_contended
            .fetch_add(report.lease_contended as u64, Ordering::Relaxed);
        self.stale_reset
            .fetch_add(report.stale_reset as u64, Ordering::Relaxed);
        self.errors.fetch_add(report.errors as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            lease_contended: self.lease_contended.load(Ordering::Relaxed),
            stale_reset: self.stale_reset.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatcher statistics
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub cycles: u64,
    pub dispatched: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub lease_contended: u64,
    pub stale_reset: u64,
    pub errors: u64,
}

/// One failed destination of a message
#[derive(Debug, Clone)]
struct DestinationFailure {
    destination: String,
    kind: FailureKind,
    reason: String,
}

/// Whether the rest of an aggregate group may proceed this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupFlow {
    Next,
    Stop,
}

fn secret_failure_kind(error: &SecretError) -> FailureKind {
    match error {
        SecretError::ProviderUnavailable { .. } => FailureKind::Transient,
        _ => FailureKind::Configuration,
    }
}

/// Drives pending outbox messages to their destinations.
pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn MessagePublisher>,
    webhooks: Arc<WebhookDispatcher>,
    secrets: Arc<dyn SecretProvider>,
    idempotency: Arc<IdempotencyStore>,
    alerter: Arc<dyn DeadLetterAlerter>,
    backoff: BackoffPolicy,
    config: DispatcherConfig,
    stats: DispatcherStats,
    trigger: Arc<Notify>,
}

impl OutboxDispatcher {
    pub fn new(deps: DispatcherDeps, config: DispatcherConfig) -> Self {
        Self {
            store: deps.store,
            publisher: deps.publisher,
            webhooks: deps.webhooks,
            secrets: deps.secrets,
            idempotency: deps.idempotency,
            alerter: deps.alerter,
            backoff: deps.backoff,
            config,
            stats: DispatcherStats::default(),
            trigger: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.store
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Handle the poll task waits on for early wake-ups.
    pub fn notifier(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// Request an early cycle. Best-effort; the poll interval still applies.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Append through the store and wake the poll task.
    pub async fn append(
        &self,
        key: &AggregateKey,
        event: OutboxEvent,
        expected_version: i64,
    ) -> Result<OutboxMessage, OutboxError> {
        let message = self.store.append(key, event, expected_version).await?;
        self.trigger();
        Ok(message)
    }

    /// Run one dispatch cycle. Never fails; every outcome lands in the report
    /// and on the stored messages.
    #[tracing::instrument(
        name = "outbox.dispatch_pending",
        skip(self),
        fields(worker_id = %self.config.worker_id)
    )]
    pub async fn dispatch_pending(&self) -> DispatchReport {
        let started = Instant::now();
        let mut report = DispatchReport::default();

        let batch = match self
            .store
            .fetch_pending(self.config.batch_size, Utc::now())
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch pending outbox messages");
                report.errors += 1;
                self.stats.record(&report);
                return report;
            }
        };

        report.fetched = batch.len();

        let mut groups: BTreeMap<AggregateKey, Vec<OutboxMessage>> = BTreeMap::new();
        for message in batch {
            groups.entry(message.aggregate_key()).or_default().push(message);
        }
        for messages in groups.values_mut() {
            messages.sort_by_key(|m| m.aggregate_version);
        }
        report.groups = groups.len();

        let group_reports: Vec<DispatchReport> = stream::iter(groups)
            .map(|(key, messages)| self.dispatch_group(key, messages))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;
        for group_report in &group_reports {
            report.merge(group_report);
        }

        if let Ok(stats) = self.store.stats().await {
            OutboxMetrics::set_pending(stats.pending + stats.failed + stats.dispatching);
        }
        OutboxMetrics::record_cycle(started.elapsed());
        self.stats.record(&report);

        if report.fetched > 0 {
            tracing::info!(
                fetched = report.fetched,
                groups = report.groups,
                dispatched = report.dispatched,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                skipped = report.skipped_by_barrier,
                lease_contended = report.lease_contended,
                duration_ms = started.elapsed().as_millis() as u64,
                "Outbox dispatch cycle completed"
            );
        }

        report
    }

    async fn dispatch_group(&self, key: AggregateKey, messages: Vec<OutboxMessage>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let owner = self.config.worker_id.as_str();
        let total = messages.len();
        let mut lease_taken_at = Instant::now();

        match self
            .store
            .try_acquire_lease(&key, owner, self.config.lease_ttl, Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                OutboxMetrics::record_lease_contended();
                tracing::debug!(aggregate = %key, "Aggregate lease held by another worker, skipping");
                report.lease_contended = 1;
                return report;
            }
            Err(e) => {
                tracing::warn!(aggregate = %key, error = %e, "Failed to acquire aggregate lease");
                report.errors += 1;
                return report;
            }
        }

        for (index, message) in messages.into_iter().enumerate() {
            // Extend the lease before each message so it never lapses mid-group
            if index > 0 {
                lease_taken_at = Instant::now();
                let renewed = self
                    .store
                    .try_acquire_lease(&key, owner, self.config.lease_ttl, Utc::now())
                    .await;
                if !matches!(renewed, Ok(true)) {
                    tracing::warn!(aggregate = %key, "Lost aggregate lease, stopping group");
                    report.skipped_by_barrier += total - index;
                    break;
                }
            }

            let deadline = lease_taken_at + self.config.delivery_budget();
            if self.dispatch_message(message, deadline, &mut report).await == GroupFlow::Stop {
                report.skipped_by_barrier += total - index - 1;
                break;
            }
        }

        if let Err(e) = self.store.release_lease(&key, owner).await {
            tracing::warn!(aggregate = %key, error = %e, "Failed to release aggregate lease");
        }

        report
    }

    async fn dispatch_message(
        &self,
        mut message: OutboxMessage,
        deadline: Instant,
        report: &mut DispatchReport,
    ) -> GroupFlow {
        let now = Utc::now();

        if message.status == OutboxStatus::Dispatching {
            match self.store.reset_stale(message.id, now).await {
                Ok(true) => {
                    OutboxMetrics::record_stale_reset();
                    report.stale_reset += 1;
                    message.attempts += 1;
                    message.status = OutboxStatus::Pending;
                    tracing::warn!(
                        message_id = %message.id,
                        attempts = message.attempts,
                        "Reset stale dispatching outbox message"
                    );

                    if message.attempts >= message.max_attempts {
                        let reason = format!(
                            "dispatch lease expired before completion after {} attempts",
                            message.attempts
                        );
                        self.dead_letter(&message, FailureKind::Transient, reason, report)
                            .await;
                        return GroupFlow::Next;
                    }
                }
                Ok(false) => {
                    report.skipped_by_barrier += 1;
                    return GroupFlow::Stop;
                }
                Err(e) => {
                    tracing::warn!(message_id = %message.id, error = %e, "Failed to reset stale message");
                    report.errors += 1;
                    return GroupFlow::Stop;
                }
            }
        }

        match self
            .store
            .mark_dispatching(message.id, now, self.config.lease_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    message_id = %message.id,
                    version = message.aggregate_version,
                    "Ordering barrier holds message back"
                );
                report.skipped_by_barrier += 1;
                return GroupFlow::Stop;
            }
            Err(e) => {
                tracing::warn!(message_id = %message.id, error = %e, "Failed to mark message dispatching");
                report.errors += 1;
                return GroupFlow::Stop;
            }
        }

        let failures = self.deliver(&message, deadline).await;

        if failures.is_empty() {
            return match self.store.mark_dispatched(message.id).await {
                Ok(()) => {
                    OutboxMetrics::record_dispatched();
                    report.dispatched += 1;
                    tracing::debug!(
                        message_id = %message.id,
                        version = message.aggregate_version,
                        "Outbox message dispatched"
                    );
                    GroupFlow::Next
                }
                Err(e) => {
                    // Left in Dispatching; the stale reset picks it up and the
                    // idempotency markers prevent redelivery
                    tracing::error!(message_id = %message.id, error = %e, "Failed to mark message dispatched");
                    report.errors += 1;
                    GroupFlow::Stop
                }
            };
        }

        let summary = failures
            .iter()
            .map(|f| format!("{}: {}", f.destination, f.reason))
            .collect::<Vec<_>>()
            .join("; ");

        if let Some(kind) = failures.iter().map(|f| f.kind).find(|k| !k.is_retryable()) {
            self.dead_letter(&message, kind, summary, report).await;
            return GroupFlow::Next;
        }

        let attempts = message.attempts + 1;
        if attempts >= message.max_attempts {
            message.attempts = attempts;
            let reason = format!("exhausted {} attempts: {}", attempts, summary);
            self.dead_letter(&message, FailureKind::Transient, reason, report)
                .await;
            return GroupFlow::Next;
        }

        let delay = self.backoff.delay_for_attempt(attempts);
        match self.store.mark_retry(message.id, delay, &summary).await {
            Ok(()) => {
                OutboxMetrics::record_retry();
                report.retried += 1;
                tracing::info!(
                    message_id = %message.id,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %summary,
                    "Outbox message scheduled for retry"
                );
            }
            Err(e) => {
                tracing::error!(message_id = %message.id, error = %e, "Failed to schedule retry");
                report.errors += 1;
            }
        }
        GroupFlow::Stop
    }

    /// Attempt every outstanding destination once, within `deadline`.
    async fn deliver(&self, message: &OutboxMessage, deadline: Instant) -> Vec<DestinationFailure> {
        let tenant = message.tenant_id.as_deref();
        let mut failures = Vec::new();

        for destination in message.outstanding_destinations() {
            let name = destination.name();

            if self.idempotency.is_delivered(tenant, message.id, &name).await {
                tracing::debug!(
                    message_id = %message.id,
                    destination = %name,
                    "Destination already acknowledged, skipping redelivery"
                );
                self.record(message.id, &name, DestinationOutcome::Deduplicated).await;
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(
                    message_id = %message.id,
                    destination = %name,
                    "Delivery budget spent before destination was attempted"
                );
                failures.push(DestinationFailure {
                    destination: name,
                    kind: FailureKind::Transient,
                    reason: "delivery budget spent before attempt".to_string(),
                });
                continue;
            }

            let timeout = self.timeout_for(destination).min(remaining);
            let outcome = match tokio::time::timeout(timeout, self.send(message, destination)).await {
                Ok(outcome) => outcome,
                Err(_) => Err((
                    FailureKind::Transient,
                    format!("timed out after {}ms", timeout.as_millis()),
                )),
            };

            match outcome {
                Ok(()) => {
                    self.idempotency.mark_delivered(tenant, message.id, &name).await;
                    self.record(message.id, &name, DestinationOutcome::Acknowledged).await;
                }
                Err((kind, reason)) => {
                    self.record(
                        message.id,
                        &name,
                        DestinationOutcome::Failed {
                            error: reason.clone(),
                        },
                    )
                    .await;
                    failures.push(DestinationFailure {
                        destination: name,
                        kind,
                        reason,
                    });
                }
            }
        }

        failures
    }

    fn timeout_for(&self, destination: &Destination) -> Duration {
        match destination {
            Destination::Webhook { timeout_ms, .. } => timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.webhooks.default_timeout())
                .min(self.config.attempt_timeout),
            Destination::Bus { .. } => self.config.attempt_timeout,
        }
    }

    async fn send(
        &self,
        message: &OutboxMessage,
        destination: &Destination,
    ) -> Result<(), (FailureKind, String)> {
        match destination {
            Destination::Bus { topic } => self
                .publisher
                .publish(MessageEnvelope::for_outbox(message, topic))
                .await
                .map_err(|e| (e.kind(), e.to_string())),
            Destination::Webhook {
                endpoint,
                secret_name,
                algorithm,
                headers,
                ..
            } => {
                let secret = self
                    .secrets
                    .get_secret(secret_name)
                    .await
                    .map_err(|e| (secret_failure_kind(&e), e.to_string()))?;
                let body = serde_json::to_vec(&message.payload)
                    .map_err(|e| (FailureKind::Permanent, format!("serialization failed: {}", e)))?;

                let mut request = self
                    .webhooks
                    .request(endpoint.as_str(), secret.value, message.event_type.as_str(), body)
                    .timeout(self.timeout_for(destination))
                    .max_attempts(1);
                request.algorithm = *algorithm;
                request.tenant_id = message.tenant_id.clone();
                request.idempotency_key = Some(idempotency_key_for(message.id));
                request.headers = headers.clone();

                match self.webhooks.dispatch(&request).await {
                    Ok(result) if result.delivered => Ok(()),
                    Ok(result) => Err((
                        result.last_failure.unwrap_or(FailureKind::Transient),
                        result
                            .last_reason()
                            .unwrap_or("webhook not delivered")
                            .to_string(),
                    )),
                    Err(e) => Err((FailureKind::Configuration, e.to_string())),
                }
            }
        }
    }

    async fn record(&self, id: Uuid, destination: &str, outcome: DestinationOutcome) {
        if let Err(e) = self.store.record_destination(id, destination, outcome).await {
            tracing::warn!(
                message_id = %id,
                destination = %destination,
                error = %e,
                "Failed to record destination outcome"
            );
        }
    }

    async fn dead_letter(
        &self,
        message: &OutboxMessage,
        kind: FailureKind,
        reason: String,
        report: &mut DispatchReport,
    ) {
        match self.store.mark_dead_lettered(message.id, &reason).await {
            Ok(()) => {
                OutboxMetrics::record_dead_lettered(kind);
                report.dead_lettered += 1;
                self.alerter
                    .alert(&DeadLetterAlert::new(message, kind, reason))
                    .await;
            }
            Err(e) => {
                tracing::error!(message_id = %message.id, error = %e, "Failed to dead-letter message");
                report.errors += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::backoff::BackoffConfig;
    use crate::cache::MemoryTenantCache;
    use crate::config::WebhookConfig;
    use crate::outbox::MemoryOutboxStore;
    use crate::publisher::{PublishError, IDEMPOTENCY_KEY_HEADER};
    use crate::secrets::InMemorySecretProvider;

    /// Fails publishes to chosen topics with a chosen error
    #[derive(Default)]
    struct ScriptedPublisher {
        failures: Mutex<Vec<(String, PublishError)>>,
        published: Mutex<Vec<MessageEnvelope>>,
    }

    impl ScriptedPublisher {
        fn fail_next(&self, topic: &str, error: PublishError) {
            self.failures.lock().unwrap().push((topic.to_string(), error));
        }

        fn published(&self) -> Vec<MessageEnvelope> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessagePublisher for ScriptedPublisher {
        async fn publish(&self, envelope: MessageEnvelope) -> Result<(), PublishError> {
            let mut failures = self.failures.lock().unwrap();
            if let Some(pos) = failures.iter().position(|(t, _)| *t == envelope.topic) {
                return Err(failures.remove(pos).1);
            }
            drop(failures);
            self.published.lock().unwrap().push(envelope);
            Ok(())
        }

        fn publisher_type(&self) -> &'static str {
            "scripted"
        }
    }

    #[derive(Default)]
    struct RecordingAlerter {
        alerts: Mutex<Vec<DeadLetterAlert>>,
    }

    #[async_trait]
    impl DeadLetterAlerter for RecordingAlerter {
        async fn alert(&self, alert: &DeadLetterAlert) {
            self.alerts.lock().unwrap().push(alert.clone());
        }
    }

    struct Harness {
        dispatcher: OutboxDispatcher,
        store: Arc<MemoryOutboxStore>,
        publisher: Arc<ScriptedPublisher>,
        alerter: Arc<RecordingAlerter>,
    }

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy::new(BackoffConfig {
            initial_delay_ms: 60_000,
            max_delay_ms: 600_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
        })
    }

    fn test_config() -> DispatcherConfig {
        DispatcherConfig {
            worker_id: "worker-test".to_string(),
            batch_size: 100,
            concurrency: 4,
            lease_ttl: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    fn build(
        store: Arc<MemoryOutboxStore>,
        publisher: Arc<dyn MessagePublisher>,
        alerter: Arc<RecordingAlerter>,
        config: DispatcherConfig,
    ) -> OutboxDispatcher {
        let cache = Arc::new(MemoryTenantCache::new());
        let deps = DispatcherDeps {
            store,
            publisher,
            webhooks: Arc::new(
                WebhookDispatcher::new(&WebhookConfig::default(), no_jitter()).unwrap(),
            ),
            secrets: Arc::new(InMemorySecretProvider::with_secrets([("crm-hook", "s3cret")])),
            idempotency: Arc::new(IdempotencyStore::new(cache, Duration::from_secs(3600))),
            alerter,
            backoff: no_jitter(),
        };
        OutboxDispatcher::new(deps, config)
    }

    fn harness(max_attempts: u32) -> Harness {
        harness_with(max_attempts, test_config())
    }

    fn harness_with(max_attempts: u32, config: DispatcherConfig) -> Harness {
        let store = Arc::new(MemoryOutboxStore::new(max_attempts));
        let publisher = Arc::new(ScriptedPublisher::default());
        let alerter = Arc::new(RecordingAlerter::default());

        Harness {
            dispatcher: build(store.clone(), publisher.clone(), alerter.clone(), config),
            store,
            publisher,
            alerter,
        }
    }

    /// Counts publish calls and never completes one
    #[derive(Default)]
    struct HangingPublisher {
        started: AtomicU64,
    }

    #[async_trait]
    impl MessagePublisher for HangingPublisher {
        async fn publish(&self, _envelope: MessageEnvelope) -> Result<(), PublishError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        fn publisher_type(&self) -> &'static str {
            "hanging"
        }
    }

    fn key(id: &str) -> AggregateKey {
        AggregateKey::new(Some("acme"), "contact", id)
    }

    fn event(n: u32) -> OutboxEvent {
        OutboxEvent::new("contact.updated", json!({ "n": n })).to_topic("contacts")
    }

    #[tokio::test]
    async fn test_dispatches_in_version_order() {
        let h = harness(5);
        for v in 0..3 {
            h.dispatcher.append(&key("1"), event(v), v as i64).await.unwrap();
        }

        let report = h.dispatcher.dispatch_pending().await;
        assert_eq!(report.fetched, 3);
        assert_eq!(report.groups, 1);
        assert_eq!(report.dispatched, 3);

        let versions: Vec<String> = h
            .publisher
            .published()
            .iter()
            .map(|e| e.headers["aggregate-version"].clone())
            .collect();
        assert_eq!(versions, vec!["1", "2", "3"]);
        assert!(h.publisher.published()[0].headers.contains_key(IDEMPOTENCY_KEY_HEADER));
    }

    #[tokio::test]
    async fn test_transient_failure_holds_back_higher_versions() {
        let h = harness(5);
        let v1 = h.dispatcher.append(&key("1"), event(1), 0).await.unwrap();
        let v2 = h.dispatcher.append(&key("1"), event(2), 1).await.unwrap();
        let other_event = OutboxEvent::new("company.updated", json!({})).to_topic("companies");
        let other = h.dispatcher.append(&key("2"), other_event, 0).await.unwrap();
        h.publisher
            .fail_next("contacts", PublishError::Transient("broker unavailable".into()));

        let report = h.dispatcher.dispatch_pending().await;
        assert_eq!(report.retried, 1);
        assert_eq!(report.skipped_by_barrier, 1);
        assert_eq!(report.dispatched, 1);

        let v1 = h.store.get(v1.id).await.unwrap().unwrap();
        assert_eq!(v1.status, OutboxStatus::Failed);
        assert_eq!(v1.attempts, 1);
        assert!(v1.last_error.unwrap().contains("broker unavailable"));
        assert_eq!(h.store.get(v2.id).await.unwrap().unwrap().status, OutboxStatus::Pending);
        assert_eq!(
            h.store.get(other.id).await.unwrap().unwrap().status,
            OutboxStatus::Dispatched
        );
    }

    #[tokio::test]
    async fn test_aggregate_in_backoff_does_not_starve_others() {
        let config = DispatcherConfig {
            batch_size: 5,
            ..test_config()
        };
        let h = harness_with(5, config);
        for v in 0..10 {
            h.dispatcher.append(&key("a"), event(v), v as i64).await.unwrap();
        }
        let other_event = OutboxEvent::new("company.updated", json!({})).to_topic("companies");
        let other = h.dispatcher.append(&key("b"), other_event, 0).await.unwrap();
        h.publisher
            .fail_next("contacts", PublishError::Transient("broker unavailable".into()));

        // The batch is filled by aggregate "a", whose head goes into backoff
        let first = h.dispatcher.dispatch_pending().await;
        assert_eq!(first.fetched, 5);
        assert_eq!(first.retried, 1);
        assert_eq!(first.skipped_by_barrier, 4);

        // Its blocked successors stay out of the next batch
        let second = h.dispatcher.dispatch_pending().await;
        assert_eq!(second.fetched, 1);
        assert_eq!(second.dispatched, 1);
        assert_eq!(
            h.store.get(other.id).await.unwrap().unwrap().status,
            OutboxStatus::Dispatched
        );
    }

    #[tokio::test]
    async fn test_slow_destinations_stay_within_lease() {
        let store = Arc::new(MemoryOutboxStore::new(5));
        let publisher = Arc::new(HangingPublisher::default());
        let config = DispatcherConfig {
            lease_ttl: Duration::from_millis(1_000),
            attempt_timeout: Duration::from_millis(300),
            ..test_config()
        };
        let dispatcher = build(
            store.clone(),
            publisher.clone(),
            Arc::new(RecordingAlerter::default()),
            config,
        );

        let event = OutboxEvent::new("contact.updated", json!({}))
            .to_topic("t1")
            .to_topic("t2")
            .to_topic("t3")
            .to_topic("t4")
            .to_topic("t5");
        let msg = dispatcher.append(&key("1"), event, 0).await.unwrap();

        let started = Instant::now();
        let report = dispatcher.dispatch_pending().await;
        let elapsed = started.elapsed();

        // Five hanging destinations at 300ms each would need 1.5s
        assert!(elapsed < Duration::from_millis(1_000), "took {:?}", elapsed);
        assert!(publisher.started.load(Ordering::SeqCst) <= 3);
        assert_eq!(report.retried, 1);

        let stored = store.get(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert!(stored.last_error.unwrap().contains("delivery budget spent"));
    }

    #[test]
    fn test_delivery_budget_is_below_lease_ttl() {
        let config = DispatcherConfig::default();
        assert!(config.delivery_budget() < config.lease_ttl);
        assert_eq!(config.delivery_budget(), Duration::from_secs(24));
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters_and_unblocks() {
        let h = harness(5);
        let v1 = h.dispatcher.append(&key("1"), event(1), 0).await.unwrap();
        let v2 = h.dispatcher.append(&key("1"), event(2), 1).await.unwrap();
        h.publisher
            .fail_next("contacts", PublishError::Permanent("schema rejected".into()));

        let report = h.dispatcher.dispatch_pending().await;
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.dispatched, 1);

        let dead = h.store.get(v1.id).await.unwrap().unwrap();
        assert_eq!(dead.status, OutboxStatus::DeadLettered);
        assert!(dead.last_error.unwrap().contains("schema rejected"));
        assert_eq!(h.store.get(v2.id).await.unwrap().unwrap().status, OutboxStatus::Dispatched);

        let alerts = h.alerter.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, FailureKind::Permanent);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_dead_letter() {
        let h = harness(1);
        let msg = h.dispatcher.append(&key("1"), event(1), 0).await.unwrap();
        h.publisher
            .fail_next("contacts", PublishError::Transient("timeout".into()));

        let report = h.dispatcher.dispatch_pending().await;
        assert_eq!(report.dead_lettered, 1);
        let stored = h.store.get(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::DeadLettered);
        assert!(stored.last_error.unwrap().starts_with("exhausted 1 attempts"));
    }

    #[tokio::test]
    async fn test_missing_webhook_secret_is_configuration_error() {
        let h = harness(5);
        let event = OutboxEvent::new("contact.created", json!({}))
            .to_destination(Destination::webhook("https://hooks.acme.test/crm", "missing-secret"));
        let msg = h.dispatcher.append(&key("1"), event, 0).await.unwrap();

        let report = h.dispatcher.dispatch_pending().await;
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(
            h.store.get(msg.id).await.unwrap().unwrap().status,
            OutboxStatus::DeadLettered
        );
        assert_eq!(h.alerter.alerts.lock().unwrap()[0].kind, FailureKind::Configuration);
    }

    #[tokio::test]
    async fn test_shadowing_webhook_header_is_configuration_error() {
        let h = harness(5);
        let mut destination = Destination::webhook("https://hooks.acme.test/crm", "crm-hook");
        if let Destination::Webhook { headers, .. } = &mut destination {
            headers.insert("X-Webhook-Signature".to_string(), "sha256=forged".to_string());
        }
        let event = OutboxEvent::new("contact.created", json!({})).to_destination(destination);
        let msg = h.dispatcher.append(&key("1"), event, 0).await.unwrap();

        let report = h.dispatcher.dispatch_pending().await;
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(
            h.store.get(msg.id).await.unwrap().unwrap().status,
            OutboxStatus::DeadLettered
        );
        assert_eq!(h.alerter.alerts.lock().unwrap()[0].kind, FailureKind::Configuration);
    }

    #[tokio::test]
    async fn test_partial_success_retries_only_outstanding_destination() {
        let h = harness(5);
        let event = OutboxEvent::new("contact.updated", json!({}))
            .to_topic("contacts")
            .to_topic("audit");
        let msg = h.dispatcher.append(&key("1"), event, 0).await.unwrap();
        h.publisher
            .fail_next("audit", PublishError::Transient("broker unavailable".into()));

        h.dispatcher.dispatch_pending().await;
        let stored = h.store.get(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert!(stored.destination_state("bus:contacts").unwrap().acknowledged);
        assert!(!stored.destination_state("bus:audit").unwrap().acknowledged);

        // Make the retry due now
        h.store.mark_retry(msg.id, Duration::ZERO, "forced").await.unwrap();
        h.dispatcher.dispatch_pending().await;

        let stored = h.store.get(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Dispatched);
        assert_eq!(stored.destination_state("bus:contacts").unwrap().attempts, 1);
        assert_eq!(stored.destination_state("bus:audit").unwrap().attempts, 2);

        let contacts = h
            .publisher
            .published()
            .iter()
            .filter(|e| e.topic == "contacts")
            .count();
        assert_eq!(contacts, 1);
    }

    #[tokio::test]
    async fn test_lease_held_elsewhere_skips_group() {
        let h = harness(5);
        let msg = h.dispatcher.append(&key("1"), event(1), 0).await.unwrap();
        h.store
            .try_acquire_lease(&key("1"), "worker-other", Duration::from_secs(30), Utc::now())
            .await
            .unwrap();

        let report = h.dispatcher.dispatch_pending().await;
        assert_eq!(report.lease_contended, 1);
        assert_eq!(report.dispatched, 0);
        assert_eq!(h.store.get(msg.id).await.unwrap().unwrap().status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn test_stale_dispatching_is_reset_and_delivered() {
        let h = harness(5);
        let msg = h.dispatcher.append(&key("1"), event(1), 0).await.unwrap();
        // Simulate a worker that crashed mid-dispatch with an already expired deadline
        h.store
            .mark_dispatching(msg.id, Utc::now(), Duration::ZERO)
            .await
            .unwrap();

        let report = h.dispatcher.dispatch_pending().await;
        assert_eq!(report.stale_reset, 1);
        assert_eq!(report.dispatched, 1);

        let stored = h.store.get(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Dispatched);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_idempotency_marker_prevents_redelivery() {
        let h = harness(5);
        let msg = h.dispatcher.append(&key("1"), event(1), 0).await.unwrap();
        h.dispatcher
            .idempotency
            .mark_delivered(Some("acme"), msg.id, "bus:contacts")
            .await;

        let report = h.dispatcher.dispatch_pending().await;
        assert_eq!(report.dispatched, 1);
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_stats_accumulate_across_cycles() {
        let h = harness(5);
        h.dispatcher.append(&key("1"), event(1), 0).await.unwrap();
        h.dispatcher.dispatch_pending().await;
        h.dispatcher.dispatch_pending().await;

        let stats = h.dispatcher.stats();
        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.dispatched, 1);
    }
}
