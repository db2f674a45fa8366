use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::infrastructure::backoff::BackoffConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub backoff: BackoffSettings,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Outbox storage and dispatcher configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    /// Storage backend: "memory" or "postgres"
    #[serde(default = "default_outbox_backend")]
    pub backend: String,
    /// Identifier written as lease owner; generated when empty
    #[serde(default)]
    pub worker_id: String,
    /// Poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum messages fetched per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Aggregate groups processed in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Per-aggregate lease lifetime in milliseconds
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    /// Per-destination attempt timeout in milliseconds
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Attempts before a message is dead-lettered
    #[serde(default = "default_outbox_max_attempts")]
    pub max_attempts: u32,
    /// Hours a dispatched message is kept before it is archived
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// Hours an archived message is kept before it is purged
    #[serde(default = "default_purge_after_hours")]
    pub purge_after_hours: u64,
    /// Retention task interval in seconds
    #[serde(default = "default_retention_interval")]
    pub retention_interval_seconds: u64,
}

/// Backoff shape shared by outbox retries and webhook retries
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffSettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Default per-attempt timeout in milliseconds
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
    /// Default attempts for direct (non-outbox) dispatches
    #[serde(default = "default_webhook_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SigningConfig {
    /// Key used when a caller does not name one
    #[serde(default = "default_key_id")]
    pub default_key_id: String,
    /// Default algorithm name ("hmac256" or "hmac512")
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Accepted clock skew for inbound callbacks in seconds
    #[serde(default = "default_max_skew_seconds")]
    pub max_skew_seconds: u64,
    /// Resolved signing keys are cached this long
    #[serde(default = "default_key_cache_ttl")]
    pub key_cache_ttl_seconds: u64,
    /// Secret provider: "memory" or "env"
    #[serde(default = "default_secret_provider")]
    pub provider: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Active expiry sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_outbox_backend() -> String {
    "memory".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    100
}

fn default_concurrency() -> usize {
    8
}

fn default_lease_ttl_ms() -> u64 {
    30_000
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

fn default_outbox_max_attempts() -> u32 {
    8
}

fn default_retention_hours() -> u64 {
    24 * 7
}

fn default_purge_after_hours() -> u64 {
    24 * 30
}

fn default_retention_interval() -> u64 {
    3600
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_webhook_timeout_ms() -> u64 {
    10_000
}

fn default_webhook_max_attempts() -> u32 {
    3
}

fn default_user_agent() -> String {
    format!("event-relay/{}", env!("CARGO_PKG_VERSION"))
}

fn default_key_id() -> String {
    "webhook-signing".to_string()
}

fn default_algorithm() -> String {
    "hmac256".to_string()
}

fn default_max_skew_seconds() -> u64 {
    300 // 5 minutes
}

fn default_key_cache_ttl() -> u64 {
    60
}

fn default_secret_provider() -> String {
    "env".to_string()
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u32 {
    5
}

fn default_idle_timeout() -> u32 {
    300
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8082)?
            .set_default("outbox.backend", "memory")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // OUTBOX__BATCH_SIZE, WEBHOOK__TIMEOUT_MS, SIGNING__MAX_SKEW_SECONDS, ...
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject combinations the dispatcher cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.outbox.validate()?;
        if self.webhook.max_attempts == 0 {
            return Err(ConfigError::Message(
                "webhook.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// A single attempt has to fit inside the lease with room to record its
    /// outcome.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attempt_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "outbox.attempt_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.lease_ttl_ms <= self.attempt_timeout_ms {
            return Err(ConfigError::Message(format!(
                "outbox.lease_ttl_ms ({}) must exceed outbox.attempt_timeout_ms ({})",
                self.lease_ttl_ms, self.attempt_timeout_ms
            )));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Message(
                "outbox.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<&BackoffSettings> for BackoffConfig {
    fn from(settings: &BackoffSettings) -> Self {
        BackoffConfig {
            initial_delay_ms: settings.initial_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            multiplier: settings.multiplier,
            jitter_factor: settings.jitter_factor,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            backend: default_outbox_backend(),
            worker_id: String::new(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            lease_ttl_ms: default_lease_ttl_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            max_attempts: default_outbox_max_attempts(),
            retention_hours: default_retention_hours(),
            purge_after_hours: default_purge_after_hours(),
            retention_interval_seconds: default_retention_interval(),
        }
    }
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_webhook_timeout_ms(),
            max_attempts: default_webhook_max_attempts(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            default_key_id: default_key_id(),
            algorithm: default_algorithm(),
            max_skew_seconds: default_max_skew_seconds(),
            key_cache_ttl_seconds: default_key_cache_ttl(),
            provider: default_secret_provider(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
        }
    }
}
