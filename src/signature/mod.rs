//! Payload signing and verification.
//!
//! Signatures are HMACs keyed by secrets resolved through the secret provider.
//! Outbound webhooks sign `{timestamp}.{body}` so receivers can reject replays;
//! the same scheme is enforced on inbound callbacks.

mod service;

pub use service::{SignatureConfig, SignatureService, SignedPayload};

use std::str::FromStr;

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::secrets::SecretError;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
/// Header carrying the unix timestamp covered by the signature.
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Signing key unavailable: {0}")]
    KeyUnavailable(#[from] SecretError),

    #[error("Signing key is not usable as an HMAC key")]
    InvalidKey,
}

/// Reasons an inbound signature is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerificationFailure {
    #[error("timestamp header is not a unix timestamp")]
    MalformedTimestamp,

    #[error("timestamp is {skew_seconds}s away from server time")]
    OutsideSkewWindow { skew_seconds: i64 },

    #[error("signing key could not be resolved")]
    KeyUnavailable,

    #[error("signature does not match payload")]
    SignatureMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    #[serde(rename = "hmac256")]
    HmacSha256,
    #[serde(rename = "hmac512")]
    HmacSha512,
}

impl SignatureAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            SignatureAlgorithm::HmacSha256 => "hmac256",
            SignatureAlgorithm::HmacSha512 => "hmac512",
        }
    }

    /// Prefix used in the rendered signature (`sha256=<hex>`).
    pub fn prefix(self) -> &'static str {
        match self {
            SignatureAlgorithm::HmacSha256 => "sha256",
            SignatureAlgorithm::HmacSha512 => "sha512",
        }
    }
}

impl Default for SignatureAlgorithm {
    fn default() -> Self {
        SignatureAlgorithm::HmacSha256
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hmac256" | "hmac-sha256" | "sha256" => Ok(SignatureAlgorithm::HmacSha256),
            "hmac512" | "hmac-sha512" | "sha512" => Ok(SignatureAlgorithm::HmacSha512),
            other => Err(SignatureError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl std::fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn hmac_digest<M: Mac + KeyInit>(
    secret: &[u8],
    timestamp: Option<&str>,
    body: &[u8],
) -> Result<Vec<u8>, SignatureError> {
    let mut mac = <M as KeyInit>::new_from_slice(secret).map_err(|_| SignatureError::InvalidKey)?;
    if let Some(timestamp) = timestamp {
        mac.update(timestamp.as_bytes());
        mac.update(b".");
    }
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Compute a rendered signature (`<prefix>=<hex>`) over `body`, optionally
/// bound to `timestamp`.
pub fn compute_signature(
    algorithm: SignatureAlgorithm,
    secret: &[u8],
    timestamp: Option<&str>,
    body: &[u8],
) -> Result<String, SignatureError> {
    let digest = match algorithm {
        SignatureAlgorithm::HmacSha256 => hmac_digest::<HmacSha256>(secret, timestamp, body)?,
        SignatureAlgorithm::HmacSha512 => hmac_digest::<HmacSha512>(secret, timestamp, body)?,
    };
    Ok(format!("{}={}", algorithm.prefix(), hex::encode(digest)))
}

/// Constant-time check of a rendered signature against a freshly computed one.
pub fn signature_matches(
    algorithm: SignatureAlgorithm,
    secret: &[u8],
    timestamp: Option<&str>,
    body: &[u8],
    provided: &str,
) -> bool {
    match compute_signature(algorithm, secret, timestamp, body) {
        Ok(expected) => constant_time_eq(expected.as_bytes(), provided.trim().as_bytes()),
        Err(_) => false,
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
