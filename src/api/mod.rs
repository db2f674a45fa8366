//! API layer - HTTP endpoint handlers organized by domain.

mod callbacks;
mod health;
mod metrics;
mod outbox;
mod routes;

pub use callbacks::{receive_callback, CallbackAccepted, CALLBACK_TOPIC};
pub use health::{health, stats};
pub use metrics::prometheus_metrics;
pub use outbox::{get_outbox_message, list_dead_letters, trigger_dispatch};
pub use routes::api_routes;
