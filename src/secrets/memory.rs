//! In-memory secret provider.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{SecretError, SecretProvider, SecretValue};

/// Process-local secret store that supports rotation.
#[derive(Default)]
pub struct InMemorySecretProvider {
    secrets: RwLock<HashMap<String, SecretValue>>,
}

impl InMemorySecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider seeded with the given secrets.
    pub fn with_secrets<I, K, V>(secrets: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let secrets = secrets
            .into_iter()
            .map(|(name, value)| {
                let name = name.into();
                (name.clone(), SecretValue::new(name, value.into()))
            })
            .collect();
        Self {
            secrets: RwLock::new(secrets),
        }
    }

    /// Insert or replace a secret without bumping its version.
    pub async fn insert(&self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        let name = name.into();
        let secret = SecretValue::new(name.clone(), value.into());
        self.secrets.write().await.insert(name, secret);
    }
}

#[async_trait]
impl SecretProvider for InMemorySecretProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretValue, SecretError> {
        self.secrets
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::NotFound {
                name: name.to_string(),
            })
    }

    async fn rotate_secret(
        &self,
        name: &str,
        next_value: &(dyn for<'a> Fn(Option<&'a SecretValue>) -> Vec<u8> + Send + Sync),
    ) -> Result<SecretValue, SecretError> {
        let mut secrets = self.secrets.write().await;
        let current = secrets.get(name);
        let value = next_value(current);
        if value.is_empty() {
            return Err(SecretError::InvalidValue {
                name: name.to_string(),
                detail: "rotated value is empty".to_string(),
            });
        }

        let rotated = SecretValue {
            name: name.to_string(),
            value,
            version: current.map(|s| s.version + 1).unwrap_or(1),
            loaded_at: Utc::now(),
        };
        secrets.insert(name.to_string(), rotated.clone());

        tracing::info!(
            secret_name = name,
            version = rotated.version,
            "Secret rotated"
        );

        Ok(rotated)
    }

    fn provider_type(&self) -> &'static str {
        "memory"
    }
}
