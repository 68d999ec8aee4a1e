//! Job worker pool.
//!
//! Workers claim jobs from the priority-weighted queues, run them through a
//! [`JobHandler`] and then acknowledge, retry or dead-letter them according
//! to the configured [`RetryPolicy`](crate::core::retry::RetryPolicy).

mod handler;
mod pool;

pub use handler::GenerationHandler;
pub use pool::{QueueWeights, WorkerConfig, WorkerPool, WorkerPoolHandle};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::generation::GenerationError;
use crate::jobs::JobCodecError;
use crate::jobs::queue::QueuedJob;

/// Errors returned by a job handler.
#[derive(Debug, Error)]
pub enum JobError {
    /// The payload does not decode; redelivery cannot fix it.
    #[error("undecodable job: {0}")]
    Decode(#[from] JobCodecError),

    /// Generation or deletion failed.
    #[error(transparent)]
    Generation(#[from] GenerationError),

    /// The handler ran past the per-job timeout.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    /// A transient error that may succeed on retry.
    #[error("transient error: {0}")]
    Transient(String),

    /// An error that will fail again on every delivery.
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl JobError {
    /// Check if this error is considered transient (should trigger retry).
    pub fn is_transient(&self) -> bool {
        match self {
            JobError::Timeout(_) | JobError::Transient(_) => true,
            JobError::Generation(e) => !e.is_permanent(),
            JobError::Decode(_) | JobError::Permanent(_) => false,
        }
    }
}

/// Runs one claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Execute `job`. Must be idempotent: delivery is at-least-once.
    async fn handle(&self, job: &QueuedJob) -> Result<(), JobError>;
}
