//! Environment variable secret provider.
//!
//! Logical names map to variables by uppercasing and replacing every
//! non-alphanumeric character with `_`: `webhook-signing/acme` is read from
//! `WEBHOOK_SIGNING_ACME`.

use async_trait::async_trait;

use super::{SecretError, SecretProvider, SecretValue};

/// Read-only provider backed by process environment variables.
#[derive(Debug, Default)]
pub struct EnvSecretProvider {
    prefix: String,
}

impl EnvSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend `prefix` to every resolved variable name.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn env_var_name(&self, logical_name: &str) -> String {
        let mapped: String = logical_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, mapped)
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretValue, SecretError> {
        let env_var = self.env_var_name(name);

        match std::env::var(&env_var) {
            Ok(value) if !value.is_empty() => {
                tracing::debug!(
                    secret_name = name,
                    env_var = %env_var,
                    "Secret loaded from environment variable"
                );
                Ok(SecretValue::new(name, value.into_bytes()))
            }
            // Empty value treated as not found
            _ => Err(SecretError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    async fn rotate_secret(
        &self,
        _name: &str,
        _next_value: &(dyn for<'a> Fn(Option<&'a SecretValue>) -> Vec<u8> + Send + Sync),
    ) -> Result<SecretValue, SecretError> {
        Err(SecretError::RotationUnsupported {
            provider: self.provider_type().to_string(),
        })
    }

    fn provider_type(&self) -> &'static str {
        "env"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_name_mapping() {
        let provider = EnvSecretProvider::new();
        assert_eq!(provider.env_var_name("webhook-signing/acme"), "WEBHOOK_SIGNING_ACME");

        let provider = EnvSecretProvider::with_prefix("RELAY_");
        assert_eq!(provider.env_var_name("key.v2"), "RELAY_KEY_V2");
    }

    #[tokio::test]
    async fn test_reads_from_environment() {
        let provider = EnvSecretProvider::with_prefix("RELAY_TEST_ENV_PROVIDER_");
        std::env::set_var("RELAY_TEST_ENV_PROVIDER_SIGNING", "from-env");

        let secret = provider.get_secret("signing").await.unwrap();
        assert_eq!(secret.as_str().unwrap(), "from-env");

        let missing = provider.get_secret("missing").await;
        assert!(matches!(missing, Err(SecretError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_rotation_is_unsupported() {
        let provider = EnvSecretProvider::new();
        let result = provider.rotate_secret("x", &|_| b"y".to_vec()).await;
        assert!(matches!(result, Err(SecretError::RotationUnsupported { .. })));
    }
}
