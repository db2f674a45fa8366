//! Prometheus metrics for the event relay.
//!
//! - Outbox metrics (appended, dispatched, retried, dead-lettered, lease contention)
//! - Dispatch cycle latency
//! - Webhook attempt outcomes
//! - Message bus publish results
//! - Tenant cache hits, misses and evictions

mod helpers;

pub use helpers::{encode_metrics, CacheMetrics, OutboxMetrics, PublishMetrics, WebhookMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "relay";

lazy_static! {
    // ============================================================================
    // Outbox Metrics
    // ============================================================================

    pub static ref OUTBOX_APPENDED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_outbox_appended_total", METRIC_PREFIX),
        "Total events appended to the outbox"
    ).unwrap();

    pub static ref OUTBOX_CONFLICTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_outbox_conflicts_total", METRIC_PREFIX),
        "Total appends rejected by the aggregate version check"
    ).unwrap();

    pub static ref OUTBOX_DISPATCHED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_outbox_dispatched_total", METRIC_PREFIX),
        "Total outbox messages dispatched to every destination"
    ).unwrap();

    pub static ref OUTBOX_RETRIES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_outbox_retries_total", METRIC_PREFIX),
        "Total outbox messages scheduled for retry"
    ).unwrap();

    pub static ref OUTBOX_DEAD_LETTERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_outbox_dead_lettered_total", METRIC_PREFIX),
        "Total outbox messages dead-lettered",
        &["reason"]
    ).unwrap();

    pub static ref OUTBOX_LEASE_CONTENDED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_outbox_lease_contended_total", METRIC_PREFIX),
        "Aggregate groups skipped because another worker held the lease"
    ).unwrap();

    pub static ref OUTBOX_STALE_RESET_TOTAL: IntCounter = register_int_counter!(
        format!("{}_outbox_stale_reset_total", METRIC_PREFIX),
        "Messages reset after a dispatching lease expired"
    ).unwrap();

    pub static ref OUTBOX_PENDING: IntGauge = register_int_gauge!(
        format!("{}_outbox_pending", METRIC_PREFIX),
        "Outbox messages waiting for dispatch"
    ).unwrap();

    pub static ref OUTBOX_CYCLE_DURATION: Histogram = register_histogram!(
        format!("{}_outbox_cycle_duration_seconds", METRIC_PREFIX),
        "Duration of one dispatch cycle in seconds",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    ).unwrap();

    // ============================================================================
    // Webhook Metrics
    // ============================================================================

    pub static ref WEBHOOK_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_webhook_attempts_total", METRIC_PREFIX),
        "Webhook delivery attempts by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref WEBHOOK_ATTEMPT_LATENCY: Histogram = register_histogram!(
        format!("{}_webhook_attempt_latency_seconds", METRIC_PREFIX),
        "Webhook attempt latency in seconds",
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    // ============================================================================
    // Publish Metrics
    // ============================================================================

    pub static ref PUBLISH_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_publish_total", METRIC_PREFIX),
        "Message bus publish results",
        &["result"]
    ).unwrap();

    // ============================================================================
    // Cache Metrics
    // ============================================================================

    pub static ref CACHE_HITS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_cache_hits_total", METRIC_PREFIX),
        "Tenant cache hits"
    ).unwrap();

    pub static ref CACHE_MISSES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_cache_misses_total", METRIC_PREFIX),
        "Tenant cache misses (including expired entries)"
    ).unwrap();

    pub static ref CACHE_EVICTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_cache_evictions_total", METRIC_PREFIX),
        "Tenant cache evictions by cause",
        &["cause"]
    ).unwrap();

    pub static ref CACHE_ENTRIES: IntGauge = register_int_gauge!(
        format!("{}_cache_entries", METRIC_PREFIX),
        "Entries currently held by the tenant cache"
    ).unwrap();
}
