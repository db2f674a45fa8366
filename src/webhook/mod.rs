//! Signed webhook delivery to tenant endpoints.

mod dispatcher;
mod models;

pub use dispatcher::{classify_status, WebhookDispatcher};
pub use models::{WebhookDispatchRequest, WebhookDispatchResult, WebhookError};

/// Header carrying the event type
pub const EVENT_TYPE_HEADER: &str = "X-Webhook-Event";
/// Header carrying the tenant id
pub const TENANT_HEADER: &str = "X-Webhook-Tenant";
/// Header carrying the 1-based attempt number
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";
/// Header carrying the idempotency key, when the caller supplies one
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
