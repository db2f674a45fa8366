//! PostgreSQL persistence module.
//!
//! Provides connection pooling and schema bootstrap for the PostgreSQL outbox store.

pub mod pool;

pub use pool::{mask_database_url, PostgresPool, PostgresPoolError};
