//! HTTP webhook dispatcher.
//!
//! Each attempt is signed with a fresh timestamp over `{timestamp}.{body}`.
//! Redirects are never followed; a 3xx counts as a failed attempt.

use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Url};

use crate::backoff::BackoffPolicy;
use crate::config::WebhookConfig;
use crate::error::FailureKind;
use crate::metrics::WebhookMetrics;
use crate::signature::{compute_signature, SIGNATURE_HEADER, TIMESTAMP_HEADER};

use super::models::{WebhookDispatchRequest, WebhookDispatchResult, WebhookError};
use super::{ATTEMPT_HEADER, EVENT_TYPE_HEADER, IDEMPOTENCY_HEADER, TENANT_HEADER};

/// Classify a response status. `None` means success.
pub fn classify_status(status: u16) -> Option<FailureKind> {
    match status {
        200..=299 => None,
        429 => Some(FailureKind::Transient),
        400..=499 => Some(FailureKind::Permanent),
        // 5xx, unfollowed 3xx and anything unexpected
        _ => Some(FailureKind::Transient),
    }
}

/// Headers the dispatcher writes itself on every attempt
const RESERVED_HEADERS: [&str; 7] = [
    SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
    EVENT_TYPE_HEADER,
    TENANT_HEADER,
    ATTEMPT_HEADER,
    IDEMPOTENCY_HEADER,
    "content-type",
];

fn caller_headers(request: &WebhookDispatchRequest) -> Result<HeaderMap, WebhookError> {
    let mut headers = HeaderMap::with_capacity(request.headers.len());
    for (name, value) in &request.headers {
        if RESERVED_HEADERS.iter().any(|r| r.eq_ignore_ascii_case(name)) {
            return Err(WebhookError::ReservedHeader(name.clone()));
        }
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| WebhookError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| WebhookError::InvalidHeader {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

fn validate(request: &WebhookDispatchRequest) -> Result<(Url, HeaderMap), WebhookError> {
    if request.max_attempts == 0 {
        return Err(WebhookError::InvalidMaxAttempts);
    }
    if request.secret.is_empty() {
        return Err(WebhookError::MissingSecret);
    }

    let url = Url::parse(&request.endpoint).map_err(|e| WebhookError::InvalidEndpoint {
        endpoint: request.endpoint.clone(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(WebhookError::InvalidEndpoint {
            endpoint: request.endpoint.clone(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok((url, caller_headers(request)?))
}

/// Delivers signed payloads with bounded retries.
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: Client,
    backoff: BackoffPolicy,
    default_timeout: Duration,
    default_max_attempts: u32,
}

impl WebhookDispatcher {
    pub fn new(config: &WebhookConfig, backoff: BackoffPolicy) -> Result<Self, WebhookError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::Client(e.to_string()))?;

        Ok(Self {
            client,
            backoff,
            default_timeout: Duration::from_millis(config.timeout_ms),
            default_max_attempts: config.max_attempts,
        })
    }

    /// Per-attempt timeout applied when a caller does not choose one.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// A request carrying the configured timeout and attempt limit.
    pub fn request(
        &self,
        endpoint: impl Into<String>,
        secret: impl Into<Vec<u8>>,
        event_type: impl Into<String>,
        payload: impl Into<bytes::Bytes>,
    ) -> WebhookDispatchRequest {
        WebhookDispatchRequest::new(endpoint, secret, event_type, payload)
            .timeout(self.default_timeout)
            .max_attempts(self.default_max_attempts)
    }

    /// Deliver `request`, retrying transient failures up to `max_attempts`.
    ///
    /// Returns `Err` only for configuration problems, before any attempt.
    /// Delivery failures are reported in the result.
    #[tracing::instrument(
        name = "webhook.dispatch",
        skip(self, request),
        fields(endpoint = %request.endpoint, event_type = %request.event_type)
    )]
    pub async fn dispatch(
        &self,
        request: &WebhookDispatchRequest,
    ) -> Result<WebhookDispatchResult, WebhookError> {
        let (url, headers) = validate(request)?;
        let mut result = WebhookDispatchResult::default();

        for attempt in 1..=request.max_attempts {
            result.attempts = attempt;

            let timestamp = Utc::now().timestamp().to_string();
            let signature = compute_signature(
                request.algorithm,
                &request.secret,
                Some(&timestamp),
                &request.payload,
            )?;

            let mut builder = self
                .client
                .post(url.clone())
                .timeout(request.timeout)
                .header(CONTENT_TYPE, "application/json")
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp.as_str())
                .header(EVENT_TYPE_HEADER, request.event_type.as_str())
                .header(ATTEMPT_HEADER, attempt.to_string());
            if let Some(tenant) = &request.tenant_id {
                builder = builder.header(TENANT_HEADER, tenant.as_str());
            }
            if let Some(key) = &request.idempotency_key {
                builder = builder.header(IDEMPOTENCY_HEADER, key.as_str());
            }
            builder = builder.headers(headers.clone());

            let started = Instant::now();
            let (kind, reason) = match builder.body(request.payload.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    result.last_status_code = Some(status.as_u16());

                    match classify_status(status.as_u16()) {
                        None => {
                            WebhookMetrics::record_success(started.elapsed());
                            result.delivered = true;
                            result.delivered_at = Some(Utc::now());
                            tracing::debug!(attempt, status = status.as_u16(), "Webhook delivered");
                            return Ok(result);
                        }
                        Some(kind) => (kind, format!("attempt {}: HTTP {}", attempt, status)),
                    }
                }
                Err(e) => {
                    let reason = if e.is_timeout() {
                        format!("attempt {}: timed out after {:?}", attempt, request.timeout)
                    } else if e.is_connect() {
                        format!("attempt {}: connection failed: {}", attempt, e)
                    } else {
                        format!("attempt {}: request failed: {}", attempt, e)
                    };
                    (FailureKind::Transient, reason)
                }
            };

            WebhookMetrics::record_failure(kind, started.elapsed());
            tracing::warn!(attempt, failure = %kind, reason = %reason, "Webhook attempt failed");
            result.failure_reasons.push(reason);
            result.last_failure = Some(kind);

            if !kind.is_retryable() {
                break;
            }
            if attempt < request.max_attempts {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            }
        }

        Ok(result)
    }
}
