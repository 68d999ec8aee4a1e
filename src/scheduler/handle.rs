//! Control handle for a running [`SweepScheduler`](super::SweepScheduler).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};

use super::types::{SchedulerCommand, SchedulerError};
use crate::core::types::JobId;

/// Commands waiting for the loop. Only trigger and shutdown exist, so a
/// short buffer is plenty.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 8;

/// Cloneable handle to the sweep trigger loop.
///
/// Calls go through the loop's command channel; once the loop has exited
/// they fail with [`SchedulerError::ChannelError`].
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) commands: mpsc::Sender<SchedulerCommand>,
    pub(crate) running: Arc<AtomicBool>,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        name: &'static str,
        command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
    ) -> Result<T, SchedulerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands.send(command(reply_tx)).await.map_err(|_| {
            SchedulerError::ChannelError(format!("scheduler stopped, {} not delivered", name))
        })?;
        reply_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("scheduler stopped before answering {}", name))
        })
    }

    /// Enqueue a sweep right away and return its job id.
    ///
    /// Unlike the periodic trigger, enqueue failures are returned.
    pub async fn trigger(&self) -> Result<JobId, SchedulerError> {
        self.request("trigger", |reply| SchedulerCommand::Trigger { reply })
            .await?
    }

    /// Stop the loop. Returns once any in-flight trigger finished or timed out.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.request("shutdown", |reply| SchedulerCommand::Shutdown { reply })
            .await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
