use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::SigningConfig;
use crate::secrets::{generate_secret, SecretProvider};

use super::{
    compute_signature, signature_matches, SignatureAlgorithm, SignatureError, VerificationFailure,
};

/// Runtime settings for the signature service
#[derive(Debug, Clone)]
pub struct SignatureConfig {
    /// Key used when the caller passes no key id
    pub default_key_id: String,
    /// Accepted distance between an inbound timestamp and server time
    pub max_skew: Duration,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            default_key_id: "webhook-signing".to_string(),
            max_skew: Duration::minutes(5),
        }
    }
}

impl From<&SigningConfig> for SignatureConfig {
    fn from(config: &SigningConfig) -> Self {
        Self {
            default_key_id: config.default_key_id.clone(),
            max_skew: Duration::seconds(config.max_skew_seconds as i64),
        }
    }
}

/// A signature bound to the timestamp it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayload {
    pub signature: String,
    pub timestamp: String,
}

/// Signs and verifies payloads with keys resolved through a secret provider.
///
/// Pass a `CachedSecretProvider` to bound how often keys are re-fetched.
pub struct SignatureService {
    secrets: Arc<dyn SecretProvider>,
    config: SignatureConfig,
}

impl SignatureService {
    pub fn new(secrets: Arc<dyn SecretProvider>, config: SignatureConfig) -> Self {
        Self { secrets, config }
    }

    pub fn config(&self) -> &SignatureConfig {
        &self.config
    }

    fn key_name<'a>(&'a self, key_id: Option<&'a str>) -> &'a str {
        key_id.unwrap_or(&self.config.default_key_id)
    }

    async fn resolve_key(&self, key_id: Option<&str>) -> Result<Vec<u8>, SignatureError> {
        let secret = self.secrets.get_secret(self.key_name(key_id)).await?;
        Ok(secret.value)
    }

    /// Sign `payload` with the key named `key_id` (or the default key).
    pub async fn sign(
        &self,
        payload: &[u8],
        algorithm: SignatureAlgorithm,
        key_id: Option<&str>,
    ) -> Result<String, SignatureError> {
        let key = self.resolve_key(key_id).await?;
        compute_signature(algorithm, &key, None, payload)
    }

    /// Verify a signature produced by [`sign`](Self::sign).
    ///
    /// Returns `false` whenever the key cannot be resolved.
    pub async fn verify(
        &self,
        payload: &[u8],
        signature: &str,
        algorithm: SignatureAlgorithm,
        key_id: Option<&str>,
    ) -> bool {
        match self.resolve_key(key_id).await {
            Ok(key) => signature_matches(algorithm, &key, None, payload, signature),
            Err(e) => {
                tracing::warn!(
                    key_id = %self.key_name(key_id),
                    error = %e,
                    "Rejecting signature: key unavailable"
                );
                false
            }
        }
    }

    /// Sign `{timestamp}.{payload}` for an outbound request.
    pub async fn sign_timestamped(
        &self,
        payload: &[u8],
        algorithm: SignatureAlgorithm,
        key_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<SignedPayload, SignatureError> {
        let key = self.resolve_key(key_id).await?;
        let timestamp = at.timestamp().to_string();
        let signature = compute_signature(algorithm, &key, Some(&timestamp), payload)?;
        Ok(SignedPayload {
            signature,
            timestamp,
        })
    }

    /// Verify an inbound callback.
    ///
    /// The timestamp must lie within the skew window around `now` even when
    /// the signature itself is valid.
    pub async fn verify_inbound(
        &self,
        payload: &[u8],
        signature: &str,
        timestamp: &str,
        algorithm: SignatureAlgorithm,
        key_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), VerificationFailure> {
        let sent_at: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| VerificationFailure::MalformedTimestamp)?;

        // Saturates for timestamps far enough away to overflow the difference
        let skew_seconds = now.timestamp().checked_sub(sent_at).unwrap_or(i64::MAX);
        if skew_seconds.unsigned_abs() > self.config.max_skew.num_seconds().unsigned_abs() {
            tracing::warn!(
                key_id = %self.key_name(key_id),
                skew_seconds,
                "Rejecting inbound callback outside skew window"
            );
            return Err(VerificationFailure::OutsideSkewWindow { skew_seconds });
        }

        let key = self
            .resolve_key(key_id)
            .await
            .map_err(|_| VerificationFailure::KeyUnavailable)?;

        if signature_matches(algorithm, &key, Some(timestamp.trim()), payload, signature) {
            Ok(())
        } else {
            Err(VerificationFailure::SignatureMismatch)
        }
    }

    /// Replace the key with a freshly generated secret. Returns the new version.
    pub async fn rotate_key(&self, key_id: Option<&str>) -> Result<u64, SignatureError> {
        let name = self.key_name(key_id);
        let rotated = self
            .secrets
            .rotate_secret(name, &|_| generate_secret())
            .await?;

        tracing::info!(key_id = %name, version = rotated.version, "Signing key rotated");
        Ok(rotated.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::{CachedSecretProvider, InMemorySecretProvider};

    fn service() -> SignatureService {
        let provider = InMemorySecretProvider::with_secrets([
            ("webhook-signing", "default-key"),
            ("tenant-a", "tenant-a-key"),
        ]);
        SignatureService::new(Arc::new(provider), SignatureConfig::default())
    }

    #[tokio::test]
    async fn test_sign_then_verify() {
        let service = service();
        let payload = br#"{"event":"contact.created"}"#;

        let signature = service
            .sign(payload, SignatureAlgorithm::HmacSha256, Some("tenant-a"))
            .await
            .unwrap();

        assert!(service.verify(payload, &signature, SignatureAlgorithm::HmacSha256, Some("tenant-a")).await);
    }

    #[tokio::test]
    async fn test_flipping_any_byte_fails_verification() {
        let service = service();
        let payload = b"deal.closed:42".to_vec();
        let signature = service
            .sign(&payload, SignatureAlgorithm::HmacSha256, None)
            .await
            .unwrap();

        for i in 0..payload.len() {
            let mut tampered = payload.clone();
            tampered[i] ^= 0x01;
            assert!(!service.verify(&tampered, &signature, SignatureAlgorithm::HmacSha256, None).await);
        }
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let service = service();
        let signature = service
            .sign(b"x", SignatureAlgorithm::HmacSha512, Some("tenant-a"))
            .await
            .unwrap();
        assert!(!service.verify(b"x", &signature, SignatureAlgorithm::HmacSha512, None).await);
    }

    #[tokio::test]
    async fn test_unresolvable_key_rejects() {
        let service = service();
        let signature = service
            .sign(b"x", SignatureAlgorithm::HmacSha256, None)
            .await
            .unwrap();
        assert!(!service.verify(b"x", &signature, SignatureAlgorithm::HmacSha256, Some("missing")).await);

        let result = service.sign(b"x", SignatureAlgorithm::HmacSha256, Some("missing")).await;
        assert!(matches!(result, Err(SignatureError::KeyUnavailable(_))));
    }

    #[tokio::test]
    async fn test_inbound_within_window_accepted() {
        let service = service();
        let now = Utc::now();
        let signed = service
            .sign_timestamped(b"cb", SignatureAlgorithm::HmacSha256, None, now - Duration::minutes(2))
            .await
            .unwrap();

        let result = service
            .verify_inbound(b"cb", &signed.signature, &signed.timestamp, SignatureAlgorithm::HmacSha256, None, now)
            .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_inbound_outside_window_rejected_despite_valid_signature() {
        let service = service();
        let now = Utc::now();
        let sent_at = now - Duration::minutes(15);
        let signed = service
            .sign_timestamped(b"cb", SignatureAlgorithm::HmacSha256, None, sent_at)
            .await
            .unwrap();

        let result = service
            .verify_inbound(b"cb", &signed.signature, &signed.timestamp, SignatureAlgorithm::HmacSha256, None, now)
            .await;
        assert!(matches!(result, Err(VerificationFailure::OutsideSkewWindow { .. })));

        // Future timestamps are rejected as well
        let signed = service
            .sign_timestamped(b"cb", SignatureAlgorithm::HmacSha256, None, now + Duration::minutes(15))
            .await
            .unwrap();
        let result = service
            .verify_inbound(b"cb", &signed.signature, &signed.timestamp, SignatureAlgorithm::HmacSha256, None, now)
            .await;
        assert!(matches!(result, Err(VerificationFailure::OutsideSkewWindow { .. })));
    }

    #[tokio::test]
    async fn test_inbound_extreme_timestamps_rejected() {
        let service = service();
        let now = Utc::now();

        let result = service
            .verify_inbound(b"cb", "00", "-9223372036854775808", SignatureAlgorithm::HmacSha256, None, now)
            .await;
        assert_eq!(
            result,
            Err(VerificationFailure::OutsideSkewWindow { skew_seconds: i64::MAX })
        );

        let result = service
            .verify_inbound(b"cb", "00", "9223372036854775807", SignatureAlgorithm::HmacSha256, None, now)
            .await;
        assert!(matches!(result, Err(VerificationFailure::OutsideSkewWindow { .. })));
    }

    #[tokio::test]
    async fn test_inbound_tampered_or_malformed() {
        let service = service();
        let now = Utc::now();
        let signed = service
            .sign_timestamped(b"cb", SignatureAlgorithm::HmacSha256, None, now)
            .await
            .unwrap();

        let result = service
            .verify_inbound(b"cb!", &signed.signature, &signed.timestamp, SignatureAlgorithm::HmacSha256, None, now)
            .await;
        assert_eq!(result, Err(VerificationFailure::SignatureMismatch));

        let result = service
            .verify_inbound(b"cb", &signed.signature, "yesterday", SignatureAlgorithm::HmacSha256, None, now)
            .await;
        assert_eq!(result, Err(VerificationFailure::MalformedTimestamp));
    }

    #[tokio::test]
    async fn test_rotation_invalidates_old_signatures() {
        let inner = Arc::new(InMemorySecretProvider::with_secrets([("webhook-signing", "v1")]));
        let cached = Arc::new(CachedSecretProvider::new(inner, 60));
        let service = SignatureService::new(cached, SignatureConfig::default());

        let old = service.sign(b"p", SignatureAlgorithm::HmacSha256, None).await.unwrap();
        let version = service.rotate_key(None).await.unwrap();
        assert_eq!(version, 2);

        assert!(!service.verify(b"p", &old, SignatureAlgorithm::HmacSha256, None).await);
        let new = service.sign(b"p", SignatureAlgorithm::HmacSha256, None).await.unwrap();
        assert!(service.verify(b"p", &new, SignatureAlgorithm::HmacSha256, None).await);
    }
}
