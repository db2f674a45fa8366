//! Transactional outbox.
//!
//! Domain writes append an event for an aggregate in the same transaction
//! that changes the aggregate. The dispatcher later delivers each event to
//! its destinations (bus topics, signed webhooks) at least once, in
//! aggregate-version order, under a per-aggregate lease.
//!
//! - `OutboxStore`: persistence contract with version CAS and an ordering barrier
//! - `MemoryOutboxStore` / `PostgresOutboxStore`: backends
//! - `OutboxDispatcher`: fetch, group, lease, deliver, retry, dead-letter

pub mod alerting;
pub mod dispatcher;
mod factory;
mod memory_store;
mod models;
pub mod postgres_store;
mod store;

pub use alerting::{DeadLetterAlert, DeadLetterAlerter, PublishingAlerter, TracingAlerter};
pub use dispatcher::{
    DispatchReport, DispatcherConfig, DispatcherDeps, DispatcherStatsSnapshot, OutboxDispatcher,
};
pub use factory::create_outbox_store;
pub use memory_store::MemoryOutboxStore;
pub use models::{
    AggregateKey, DeliveryState, Destination, DestinationOutcome, DestinationState, OutboxEvent,
    OutboxMessage, OutboxStats, OutboxStatus,
};
pub use postgres_store::PostgresOutboxStore;
pub use store::{OutboxError, OutboxStore};
