//! Scheduler type definitions.
//!
//! Scheduler errors and the commands its handle sends.

use crate::core::schedule::ScheduleError;
use crate::core::types::JobId;
use crate::jobs::EnqueueError;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),

    /// The sweep job could not be enqueued.
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    /// The trigger schedule is invalid.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Commands that can be sent to the scheduler loop.
pub(crate) enum SchedulerCommand {
    /// Enqueue a sweep now.
    Trigger {
        reply: oneshot::Sender<Result<JobId, SchedulerError>>,
    },
    /// Stop after the in-flight trigger.
    Shutdown { reply: oneshot::Sender<()> },
}
