//! Periodic sweep trigger.
//!
//! This module provides the scheduling loop that enqueues the daily sweep
//! job, and the handle used to trigger and stop it.

mod engine;
mod handle;
mod types;

pub use engine::{DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_TICK_INTERVAL, SweepScheduler};
pub use handle::SchedulerHandle;
pub use types::SchedulerError;
