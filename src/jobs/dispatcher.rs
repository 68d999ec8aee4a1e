//! Turns template lifecycle events into queued generation jobs.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::queue::{EnqueueError, EnqueueOptions, JobQueue};
use super::{GenerationJob, QueueClass};
use crate::core::template::RecurrenceTemplate;
use crate::core::types::{JobId, TemplateId};

/// Default hold-back of the regenerate job after an update.
pub const DEFAULT_REGENERATE_DELAY: Duration = Duration::from_secs(1);

/// Jobs enqueued for a template update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateJobs {
    pub delete: JobId,
    pub generate: JobId,
}

/// Enqueues generation jobs with the right queue class and delay.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    regenerate_delay: Duration,
}

impl Dispatcher {
    /// Create a dispatcher writing to `queue`.
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            regenerate_delay: DEFAULT_REGENERATE_DELAY,
        }
    }

    /// Set how long the regenerate job waits behind the delete job on update.
    pub fn with_regenerate_delay(mut self, delay: Duration) -> Self {
        self.regenerate_delay = delay;
        self
    }

    /// The queue jobs are written to.
    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// A template was created: materialize it right away.
    pub async fn template_created(
        &self,
        template: &RecurrenceTemplate,
    ) -> Result<JobId, EnqueueError> {
        let job = GenerationJob::GenerateByTemplate {
            template: template.clone(),
            regenerate_since: None,
        };
        let id = self
            .queue
            .enqueue(&job, EnqueueOptions::on(QueueClass::Critical))
            .await?;
        tracing::debug!(job_id = %id, template_id = %template.id, "Enqueued generation for new template");
        Ok(id)
    }

    /// A template was updated: drop its future instances, then regenerate.
    ///
    /// The regenerate job is delayed so it usually runs after the delete job,
    /// but either order ends in the same rows: regeneration rewrites the open
    /// future instances itself, and the delete job only removes rows written
    /// before it was enqueued.
    pub async fn template_updated(
        &self,
        previous_id: TemplateId,
        updated: &RecurrenceTemplate,
        updated_at: DateTime<Utc>,
    ) -> Result<UpdateJobs, EnqueueError> {
        let delete = self
            .queue
            .enqueue(
                &GenerationJob::DeleteByTemplate {
                    template_id: previous_id,
                },
                EnqueueOptions::on(QueueClass::Critical),
            )
            .await?;

        let generate = self
            .queue
            .enqueue(
                &GenerationJob::GenerateByTemplate {
                    template: updated.clone(),
                    regenerate_since: Some(updated_at),
                },
                EnqueueOptions::on(QueueClass::Critical).delayed(self.regenerate_delay),
            )
            .await?;

        tracing::debug!(
            template_id = %updated.id,
            delete_job = %delete,
            generate_job = %generate,
            "Enqueued regeneration for updated template"
        );
        Ok(UpdateJobs { delete, generate })
    }

    /// A template was deleted: drop its future instances.
    pub async fn template_deleted(&self, template_id: TemplateId) -> Result<JobId, EnqueueError> {
        let id = self
            .queue
            .enqueue(
                &GenerationJob::DeleteByTemplate { template_id },
                EnqueueOptions::on(QueueClass::Critical),
            )
            .await?;
        tracing::debug!(job_id = %id, template_id = %template_id, "Enqueued cleanup for deleted template");
        Ok(id)
    }

    /// Enqueue a sweep over every due template.
    pub async fn enqueue_sweep(&self) -> Result<JobId, EnqueueError> {
        self.queue
            .enqueue(&GenerationJob::Sweep, EnqueueOptions::on(QueueClass::Default))
            .await
    }

    /// Periodic trigger entry point. Failures are logged, never returned.
    pub async fn daily_sweep(&self) -> Option<JobId> {
        match self.enqueue_sweep().await {
            Ok(id) => {
                tracing::info!(job_id = %id, "Enqueued daily sweep");
                Some(id)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to enqueue daily sweep");
                None
            }
        }
    }
}
