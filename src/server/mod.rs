mod app;
mod state;

pub use app::create_app;
pub use state::{idempotency_ttl, AppState, DEAD_LETTER_TOPIC};
