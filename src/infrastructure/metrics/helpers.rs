//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    CACHE_ENTRIES, CACHE_EVICTIONS_TOTAL, CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL,
    OUTBOX_APPENDED_TOTAL, OUTBOX_CONFLICTS_TOTAL, OUTBOX_CYCLE_DURATION,
    OUTBOX_DEAD_LETTERED_TOTAL, OUTBOX_DISPATCHED_TOTAL, OUTBOX_LEASE_CONTENDED_TOTAL,
    OUTBOX_PENDING, OUTBOX_RETRIES_TOTAL, OUTBOX_STALE_RESET_TOTAL, PUBLISH_TOTAL,
    WEBHOOK_ATTEMPTS_TOTAL, WEBHOOK_ATTEMPT_LATENCY,
};
use crate::infrastructure::error::FailureKind;

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording outbox metrics
pub struct OutboxMetrics;

impl OutboxMetrics {
    pub fn record_appended() {
        OUTBOX_APPENDED_TOTAL.inc();
    }

    pub fn record_conflict() {
        OUTBOX_CONFLICTS_TOTAL.inc();
    }

    pub fn record_dispatched() {
        OUTBOX_DISPATCHED_TOTAL.inc();
    }

    pub fn record_retry() {
        OUTBOX_RETRIES_TOTAL.inc();
    }

    pub fn record_dead_lettered(kind: FailureKind) {
        OUTBOX_DEAD_LETTERED_TOTAL
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn record_lease_contended() {
        OUTBOX_LEASE_CONTENDED_TOTAL.inc();
    }

    pub fn record_stale_reset() {
        OUTBOX_STALE_RESET_TOTAL.inc();
    }

    pub fn set_pending(count: usize) {
        OUTBOX_PENDING.set(count as i64);
    }

    pub fn record_cycle(duration: Duration) {
        OUTBOX_CYCLE_DURATION.observe(duration.as_secs_f64());
    }
}

/// Helper struct for recording webhook metrics
pub struct WebhookMetrics;

impl WebhookMetrics {
    pub fn record_success(latency: Duration) {
        WEBHOOK_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
        WEBHOOK_ATTEMPT_LATENCY.observe(latency.as_secs_f64());
    }

    pub fn record_failure(kind: FailureKind, latency: Duration) {
        WEBHOOK_ATTEMPTS_TOTAL
            .with_label_values(&[kind.as_str()])
            .inc();
        WEBHOOK_ATTEMPT_LATENCY.observe(latency.as_secs_f64());
    }
}

/// Helper struct for recording publish metrics
pub struct PublishMetrics;

impl PublishMetrics {
    pub fn record_published() {
        PUBLISH_TOTAL.with_label_values(&["ok"]).inc();
    }

    pub fn record_rejected(kind: FailureKind) {
        PUBLISH_TOTAL.with_label_values(&[kind.as_str()]).inc();
    }
}

/// Helper struct for recording tenant cache metrics
pub struct CacheMetrics;

impl CacheMetrics {
    pub fn record_hit() {
        CACHE_HITS_TOTAL.inc();
    }

    pub fn record_miss() {
        CACHE_MISSES_TOTAL.inc();
    }

    pub fn record_expired(count: usize) {
        CACHE_EVICTIONS_TOTAL
            .with_label_values(&["expired"])
            .inc_by(count as u64);
    }

    pub fn record_invalidated(count: usize) {
        CACHE_EVICTIONS_TOTAL
            .with_label_values(&["invalidated"])
            .inc_by(count as u64);
    }

    pub fn set_entries(count: usize) {
        CACHE_ENTRIES.set(count as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_metrics() {
        OutboxMetrics::record_appended();
        WebhookMetrics::record_failure(FailureKind::Transient, Duration::from_millis(3));
        CacheMetrics::record_hit();

        let output = encode_metrics().unwrap();
        assert!(output.contains("relay_outbox_appended_total"));
        assert!(output.contains("relay_webhook_attempts_total"));
        assert!(output.contains("relay_cache_hits_total"));
    }
}
