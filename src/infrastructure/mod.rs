//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `backoff`: Exponential backoff with jitter shared by the outbox and webhook paths
//! - `config`: Application configuration and settings
//! - `error`: Unified error types and the failure taxonomy
//! - `metrics`: Prometheus metrics helpers
//! - `postgres`: PostgreSQL connection pool

pub mod backoff;
pub mod config;
pub mod error;
pub mod metrics;
pub mod postgres;
