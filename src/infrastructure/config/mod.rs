mod settings;

pub use settings::{
    BackoffSettings, CacheConfig, DatabaseConfig, LoggingConfig, OutboxConfig, ServerConfig,
    Settings, SigningConfig, WebhookConfig,
};
