use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backoff::{BackoffConfig, BackoffPolicy};
use crate::cache::{IdempotencyStore, MemoryTenantCache, TenantCache};
use crate::config::{OutboxConfig, Settings};
use crate::error::{AppError, Result};
use crate::outbox::{
    create_outbox_store, DispatcherConfig, DispatcherDeps, OutboxDispatcher, OutboxStore,
    PublishingAlerter,
};
use crate::postgres::PostgresPool;
use crate::publisher::{InMemoryMessageBus, MessagePublisher};
use crate::secrets::{create_secret_provider, CachedSecretProvider, SecretProvider};
use crate::signature::{SignatureAlgorithm, SignatureConfig, SignatureService};
use crate::webhook::WebhookDispatcher;

/// Topic receiving dead-letter alerts
pub const DEAD_LETTER_TOPIC: &str = "outbox.dead_letters";

/// Idempotency markers must outlive every retry of a message.
///
/// Covers the backoff horizon plus one lease window per attempt, with a
/// floor of one hour.
pub fn idempotency_ttl(config: &OutboxConfig, backoff: &BackoffPolicy) -> Duration {
    let attempts = config.max_attempts.max(1);
    let horizon = backoff.max_horizon(attempts) + config.lease_ttl() * attempts;
    horizon.max(Duration::from_secs(3600))
}

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub start_time: Instant,
    pub outbox: Arc<dyn OutboxStore>,
    pub dispatcher: Arc<OutboxDispatcher>,
    pub cache: Arc<dyn TenantCache>,
    pub bus: Arc<InMemoryMessageBus>,
    pub secrets: Arc<CachedSecretProvider>,
    pub signatures: Arc<SignatureService>,
    pub signing_algorithm: SignatureAlgorithm,
    pub postgres_pool: Option<PostgresPool>,
}

impl AppState {
    pub fn new(settings: Settings, postgres_pool: Option<PostgresPool>) -> Result<Self> {
        let backoff = BackoffPolicy::new(BackoffConfig::from(&settings.backoff));

        let signing_algorithm = SignatureAlgorithm::from_str(&settings.signing.algorithm)
            .map_err(|e| AppError::Validation(e.to_string()))?;

        let secrets = create_secret_provider(&settings.signing);
        let signatures = Arc::new(SignatureService::new(
            secrets.clone(),
            SignatureConfig::from(&settings.signing),
        ));

        let cache: Arc<dyn TenantCache> = Arc::new(MemoryTenantCache::new());
        let idempotency = Arc::new(IdempotencyStore::new(
            cache.clone(),
            idempotency_ttl(&settings.outbox, &backoff),
        ));

        let bus = Arc::new(InMemoryMessageBus::new());
        let publisher: Arc<dyn MessagePublisher> = bus.clone();

        let webhooks = Arc::new(
            WebhookDispatcher::new(&settings.webhook, backoff.clone())
                .map_err(|e| AppError::Internal(e.to_string()))?,
        );

        let outbox = create_outbox_store(&settings.outbox, postgres_pool.as_ref());
        let deps = DispatcherDeps {
            store: outbox.clone(),
            publisher: publisher.clone(),
            webhooks,
            secrets: secrets.clone(),
            idempotency,
            alerter: Arc::new(PublishingAlerter::new(publisher, DEAD_LETTER_TOPIC)),
            backoff,
        };
        let dispatcher = Arc::new(OutboxDispatcher::new(
            deps,
            DispatcherConfig::from(&settings.outbox),
        ));

        tracing::info!(
            worker_id = %dispatcher.config().worker_id,
            outbox_backend = %settings.outbox.backend,
            secret_provider = %secrets.provider_type(),
            signing_algorithm = %signing_algorithm,
            "Application state initialized"
        );

        Ok(Self {
            settings: Arc::new(settings),
            start_time: Instant::now(),
            outbox,
            dispatcher,
            cache,
            bus,
            secrets,
            signatures,
            signing_algorithm,
            postgres_pool,
        })
    }
}
