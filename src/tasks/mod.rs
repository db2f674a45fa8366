//! Background tasks driven by timers and a shared shutdown broadcast.

mod cache_sweep;
mod outbox_poll;

pub use cache_sweep::CacheSweepTask;
pub use outbox_poll::{OutboxPollTask, RetentionPolicy};
