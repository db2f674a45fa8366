//! End-to-end outbox pipeline tests
//!
//! Wires the in-memory outbox store, topic bus, tenant cache and a local
//! webhook receiver together through the public API.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use chrono::Utc;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_test::assert_ok;

use event_relay_service::backoff::{BackoffConfig, BackoffPolicy};
use event_relay_service::cache::{tenant_scope, IdempotencyStore, MemoryTenantCache, TenantCache};
use event_relay_service::config::WebhookConfig;
use event_relay_service::outbox::{
    AggregateKey, DeliveryState, Destination, DispatcherConfig, DispatcherDeps, MemoryOutboxStore,
    OutboxDispatcher, OutboxError, OutboxEvent, OutboxStatus, OutboxStore, PublishingAlerter,
};
use event_relay_service::publisher::{
    idempotency_key_for, InMemoryMessageBus, MessageEnvelope, MessagePublisher,
    AGGREGATE_VERSION_HEADER, IDEMPOTENCY_KEY_HEADER,
};
use event_relay_service::secrets::InMemorySecretProvider;
use event_relay_service::webhook::{WebhookDispatcher, IDEMPOTENCY_HEADER};

const DEAD_LETTERS: &str = "outbox.dead_letters";

/// Local webhook endpoint answering scripted statuses
#[derive(Clone)]
struct Endpoint {
    script: Arc<Mutex<VecDeque<u16>>>,
    fallback: u16,
    requests: Arc<Mutex<Vec<HeaderMap>>>,
}

async fn endpoint_handler(State(endpoint): State<Endpoint>, headers: HeaderMap, _body: Bytes) -> StatusCode {
    endpoint.requests.lock().unwrap().push(headers);
    let status = endpoint
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(endpoint.fallback);
    StatusCode::from_u16(status).unwrap()
}

async fn spawn_endpoint(script: Vec<u16>, fallback: u16) -> (String, Endpoint) {
    let endpoint = Endpoint {
        script: Arc::new(Mutex::new(script.into())),
        fallback,
        requests: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/crm-hook", post(endpoint_handler))
        .with_state(endpoint.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/crm-hook", addr), endpoint)
}

struct Pipeline {
    store: Arc<MemoryOutboxStore>,
    bus: Arc<InMemoryMessageBus>,
    cache: Arc<MemoryTenantCache>,
    idempotency: Arc<IdempotencyStore>,
    webhooks: Arc<WebhookDispatcher>,
    secrets: Arc<InMemorySecretProvider>,
    backoff: BackoffPolicy,
}

impl Pipeline {
    fn new(default_max_attempts: u32) -> Self {
        let backoff = BackoffPolicy::new(BackoffConfig {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
            jitter_factor: 0.0,
        });
        let cache = Arc::new(MemoryTenantCache::new());

        Self {
            store: Arc::new(MemoryOutboxStore::new(default_max_attempts)),
            bus: Arc::new(InMemoryMessageBus::new()),
            idempotency: Arc::new(IdempotencyStore::new(cache.clone(), Duration::from_secs(3600))),
            cache,
            webhooks: Arc::new(
                WebhookDispatcher::new(&WebhookConfig::default(), backoff.clone()).unwrap(),
            ),
            secrets: Arc::new(InMemorySecretProvider::with_secrets([("acme-hooks", "whsec_acme")])),
            backoff,
        }
    }

    fn worker(&self, worker_id: &str) -> OutboxDispatcher {
        let publisher: Arc<dyn MessagePublisher> = self.bus.clone();
        let deps = DispatcherDeps {
            store: self.store.clone(),
            publisher: publisher.clone(),
            webhooks: self.webhooks.clone(),
            secrets: self.secrets.clone(),
            idempotency: self.idempotency.clone(),
            alerter: Arc::new(PublishingAlerter::new(publisher, DEAD_LETTERS)),
            backoff: self.backoff.clone(),
        };
        let config = DispatcherConfig {
            worker_id: worker_id.to_string(),
            batch_size: 100,
            concurrency: 4,
            lease_ttl: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(2),
        };
        OutboxDispatcher::new(deps, config)
    }
}

fn drain(rx: &mut broadcast::Receiver<MessageEnvelope>) -> Vec<MessageEnvelope> {
    let mut received = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        received.push(envelope);
    }
    received
}

fn contact(id: &str) -> AggregateKey {
    AggregateKey::new(Some("acme"), "contact", id)
}

#[tokio::test]
async fn test_events_reach_the_bus_in_version_order() {
    let pipeline = Pipeline::new(5);
    let worker = pipeline.worker("worker-a");
    let mut rx = pipeline.bus.subscribe("contacts");

    for aggregate in ["1", "2"] {
        for version in 0..4 {
            let event = OutboxEvent::new("contact.updated", json!({ "step": version }))
                .to_topic("contacts");
            worker.append(&contact(aggregate), event, version).await.unwrap();
        }
    }

    let report = worker.dispatch_pending().await;
    assert_eq!(report.fetched, 8);
    assert_eq!(report.groups, 2);
    assert_eq!(report.dispatched, 8);

    let received = drain(&mut rx);
    assert_eq!(received.len(), 8);
    for aggregate in ["1", "2"] {
        let versions: Vec<i64> = received
            .iter()
            .filter(|e| e.headers["aggregate-id"] == aggregate)
            .map(|e| e.headers[AGGREGATE_VERSION_HEADER].parse().unwrap())
            .collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }
}

#[tokio::test]
async fn test_stale_expected_version_is_a_conflict() {
    let pipeline = Pipeline::new(5);
    let key = contact("7");
    let event = || OutboxEvent::new("contact.created", json!({})).to_topic("contacts");

    pipeline.store.append(&key, event(), 0).await.unwrap();
    let conflict = pipeline.store.append(&key, event(), 0).await;
    assert!(matches!(
        conflict,
        Err(OutboxError::ConcurrencyConflict { expected: 0, actual: 1, .. })
    ));

    let next = pipeline.store.append(&key, event(), 1).await.unwrap();
    assert_eq!(next.aggregate_version, 2);
}

#[tokio::test]
async fn test_only_one_worker_holds_an_aggregate_lease() {
    let pipeline = Pipeline::new(5);
    let key = contact("lease");
    let now = Utc::now();
    let ttl = Duration::from_secs(30);

    let attempts = (0..16).map(|i| {
        let store = pipeline.store.clone();
        let key = key.clone();
        async move {
            store
                .try_acquire_lease(&key, &format!("worker-{}", i), ttl, now)
                .await
                .unwrap()
        }
    });
    let acquired = futures::future::join_all(attempts).await;
    assert_eq!(acquired.iter().filter(|won| **won).count(), 1);
}

#[tokio::test]
async fn test_racing_workers_deliver_each_message_once() {
    let pipeline = Pipeline::new(5);
    let worker_a = pipeline.worker("worker-a");
    let worker_b = pipeline.worker("worker-b");
    let mut rx = pipeline.bus.subscribe("contacts");

    for aggregate in 0..6 {
        for version in 0..3 {
            let event = OutboxEvent::new("contact.updated", json!({})).to_topic("contacts");
            worker_a
                .append(&contact(&aggregate.to_string()), event, version)
                .await
                .unwrap();
        }
    }

    let (a, b) = tokio::join!(worker_a.dispatch_pending(), worker_b.dispatch_pending());
    // Anything left over (both skipped a group) is picked up by a later cycle
    let c = worker_a.dispatch_pending().await;

    assert_eq!(a.dispatched + b.dispatched + c.dispatched, 18);
    let received = drain(&mut rx);
    assert_eq!(received.len(), 18);

    let mut keys: Vec<&str> = received.iter().filter_map(|e| e.idempotency_key()).collect();
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len(), 18);
}

#[tokio::test]
async fn test_mark_dispatched_twice_is_a_no_op() {
    let pipeline = Pipeline::new(5);
    let message = pipeline
        .store
        .append(&contact("9"), OutboxEvent::new("contact.merged", json!({})).to_topic("contacts"), 0)
        .await
        .unwrap();

    assert!(pipeline
        .store
        .mark_dispatching(message.id, Utc::now(), Duration::from_secs(30))
        .await
        .unwrap());
    assert_ok!(pipeline.store.mark_dispatched(message.id).await);
    let first = pipeline.store.get(message.id).await.unwrap().unwrap();

    assert_ok!(pipeline.store.mark_dispatched(message.id).await);
    let second = pipeline.store.get(message.id).await.unwrap().unwrap();

    assert_eq!(second.status, OutboxStatus::Dispatched);
    assert_eq!(first.dispatched_at, second.dispatched_at);
    assert_eq!(second.delivery_state(), DeliveryState::Delivered);
}

#[tokio::test]
async fn test_partial_failure_retries_only_the_webhook() {
    let (url, endpoint) = spawn_endpoint(vec![500], 200).await;
    let pipeline = Pipeline::new(5);
    let worker = pipeline.worker("worker-a");
    let mut rx = pipeline.bus.subscribe("deals");

    let event = OutboxEvent::new("deal.closed", json!({ "deal_id": 42 }))
        .to_topic("deals")
        .to_destination(Destination::webhook(url.as_str(), "acme-hooks"));
    let message = worker
        .append(&AggregateKey::new(Some("acme"), "deal", "42"), event, 0)
        .await
        .unwrap();

    let first = worker.dispatch_pending().await;
    assert_eq!(first.retried, 1);

    let stored = pipeline.store.get(message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Failed);
    assert_eq!(stored.delivery_state(), DeliveryState::Retrying);
    assert!(stored.destination_state("bus:deals").unwrap().acknowledged);
    let hook_name = format!("webhook:{}", url);
    assert!(!stored.destination_state(&hook_name).unwrap().acknowledged);

    // Backoff is a few milliseconds
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = worker.dispatch_pending().await;
    assert_eq!(second.dispatched, 1);

    let stored = pipeline.store.get(message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Dispatched);
    assert_eq!(stored.destination_state("bus:deals").unwrap().attempts, 1);
    assert_eq!(stored.destination_state(&hook_name).unwrap().attempts, 2);

    // The bus saw the event once, the webhook twice with one idempotency key
    assert_eq!(drain(&mut rx).len(), 1);
    let requests = endpoint.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    let expected_key = idempotency_key_for(message.id);
    for headers in &requests {
        assert_eq!(headers[IDEMPOTENCY_HEADER], expected_key.as_str());
    }

    // Acknowledged destinations leave tenant-scoped idempotency markers
    let marker = pipeline
        .cache
        .get(&tenant_scope(Some("acme")), &format!("outbox:{}:bus:deals", message.id))
        .await
        .unwrap();
    assert!(marker.is_some());
    assert!(pipeline
        .idempotency
        .is_delivered(Some("acme"), message.id, &hook_name)
        .await);
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_and_alert() {
    let (url, _endpoint) = spawn_endpoint(Vec::new(), 503).await;
    let pipeline = Pipeline::new(5);
    let worker = pipeline.worker("worker-a");
    let mut alerts = pipeline.bus.subscribe(DEAD_LETTERS);

    let event = OutboxEvent::new("contact.deleted", json!({}))
        .to_destination(Destination::webhook(url.as_str(), "acme-hooks"))
        .max_attempts(3);
    let message = worker.append(&contact("3"), event, 0).await.unwrap();

    let mut dead_lettered = 0;
    for _ in 0..3 {
        dead_lettered += worker.dispatch_pending().await.dead_lettered;
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert_eq!(dead_lettered, 1);

    let stored = pipeline.store.get(message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::DeadLettered);
    assert_eq!(stored.delivery_state(), DeliveryState::DeadLettered);
    assert!(stored.last_error.unwrap().contains("exhausted 3 attempts"));

    let dead = pipeline.store.list_dead_lettered(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, message.id);

    let alert = drain(&mut alerts);
    assert_eq!(alert.len(), 1);
    assert_eq!(alert[0].message["message_id"], json!(message.id.to_string()));
    assert!(alert[0].headers.contains_key(IDEMPOTENCY_KEY_HEADER));

    // Further cycles leave the dead letter alone
    assert_eq!(worker.dispatch_pending().await.fetched, 0);
}

#[tokio::test]
async fn test_dead_letter_unblocks_later_versions() {
    let pipeline = Pipeline::new(5);
    let worker = pipeline.worker("worker-a");
    let mut rx = pipeline.bus.subscribe("contacts");
    let key = contact("11");

    // The webhook secret does not exist: a configuration failure
    let broken = OutboxEvent::new("contact.updated", json!({}))
        .to_destination(Destination::webhook("https://hooks.acme.test/x", "missing"));
    let v1 = worker.append(&key, broken, 0).await.unwrap();
    let v2 = worker
        .append(&key, OutboxEvent::new("contact.updated", json!({})).to_topic("contacts"), 1)
        .await
        .unwrap();

    let report = worker.dispatch_pending().await;
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.dispatched, 1);

    assert_eq!(
        pipeline.store.get(v1.id).await.unwrap().unwrap().status,
        OutboxStatus::DeadLettered
    );
    assert_eq!(
        pipeline.store.get(v2.id).await.unwrap().unwrap().status,
        OutboxStatus::Dispatched
    );
    assert_eq!(drain(&mut rx).len(), 1);
}
