//! Signing secret providers.
//!
//! The relay only consumes a read/rotate contract: `get_secret(name)` and
//! `rotate_secret(name, next_value)`. Storage backends live behind the
//! `SecretProvider` trait:
//!
//! - `InMemorySecretProvider`: process-local secrets, supports rotation
//! - `EnvSecretProvider`: read-only secrets from environment variables
//! - `CachedSecretProvider`: TTL cache wrapper around any provider

mod cache;
mod env;
mod memory;

pub use cache::{CachedSecretProvider, SecretCacheStats};
pub use env::EnvSecretProvider;
pub use memory::InMemorySecretProvider;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::SigningConfig;

/// Errors returned by secret provider operations.
#[derive(Debug, Clone, Error)]
pub enum SecretError {
    #[error("Secret not found: '{name}'")]
    NotFound { name: String },

    #[error("Secret provider '{provider}' unavailable: {detail}")]
    ProviderUnavailable { provider: String, detail: String },

    #[error("Invalid secret value for '{name}': {detail}")]
    InvalidValue { name: String, detail: String },

    #[error("Secret provider '{provider}' does not support rotation")]
    RotationUnsupported { provider: String },
}

/// A resolved secret value.
#[derive(Clone)]
pub struct SecretValue {
    /// Logical secret name (e.g., "webhook-signing/acme")
    pub name: String,
    /// Raw secret bytes
    pub value: Vec<u8>,
    /// Monotonic version, bumped on every rotation
    pub version: u64,
    /// When this value was fetched or created
    pub loaded_at: DateTime<Utc>,
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretValue")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .field("version", &self.version)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

impl SecretValue {
    pub fn new(name: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            value,
            version: 1,
            loaded_at: Utc::now(),
        }
    }

    /// Interpret the secret value as a UTF-8 string.
    pub fn as_str(&self) -> Result<&str, SecretError> {
        std::str::from_utf8(&self.value).map_err(|e| SecretError::InvalidValue {
            name: self.name.clone(),
            detail: format!("Not valid UTF-8: {e}"),
        })
    }
}

/// Source of signing secrets.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Resolve the current value of a secret.
    async fn get_secret(&self, name: &str) -> Result<SecretValue, SecretError>;

    /// Replace a secret with the value produced by `next_value`.
    ///
    /// `next_value` receives the current value, if any.
    async fn rotate_secret(
        &self,
        name: &str,
        next_value: &(dyn for<'a> Fn(Option<&'a SecretValue>) -> Vec<u8> + Send + Sync),
    ) -> Result<SecretValue, SecretError>;

    /// Short identifier used in logs and errors.
    fn provider_type(&self) -> &'static str;
}

/// Generate a random 256-bit secret, hex encoded.
pub fn generate_secret() -> Vec<u8> {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes).into_bytes()
}

/// Create the secret provider named in the configuration, wrapped in a TTL cache.
pub fn create_secret_provider(config: &SigningConfig) -> Arc<CachedSecretProvider> {
    let inner: Arc<dyn SecretProvider> = match config.provider.as_str() {
        "memory" => {
            tracing::warn!(
                key_id = %config.default_key_id,
                "Using in-memory secret provider with a generated default key"
            );
            Arc::new(InMemorySecretProvider::with_secrets([(
                config.default_key_id.clone(),
                generate_secret(),
            )]))
        }
        other => {
            if other != "env" {
                tracing::warn!(provider = %other, "Unknown secret provider, falling back to env");
            }
            Arc::new(EnvSecretProvider::new())
        }
    };

    Arc::new(CachedSecretProvider::new(inner, config.key_cache_ttl_seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_value_debug_is_redacted() {
        let secret = SecretValue::new("webhook-signing", b"super-secret".to_vec());
        let debug = format!("{:?}", secret);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn test_generated_secrets_are_unique_hex() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.iter().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_factory_selects_provider() {
        let config = SigningConfig {
            provider: "memory".to_string(),
            ..Default::default()
        };
        assert_eq!(create_secret_provider(&config).inner().provider_type(), "memory");

        let config = SigningConfig::default();
        assert_eq!(create_secret_provider(&config).inner().provider_type(), "env");
    }
}
