//! Handler routing decoded generation jobs to the generation service.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use super::{JobError, JobHandler};
use crate::generation::{GenerationOutcome, GenerationService};
use crate::jobs::GenerationJob;
use crate::jobs::queue::QueuedJob;
use crate::storage::Store;

/// Decodes queued jobs and runs them against the store.
pub struct GenerationHandler<S: Store> {
    service: Arc<GenerationService<S>>,
}

impl<S: Store> GenerationHandler<S> {
    pub fn new(service: Arc<GenerationService<S>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S: Store> JobHandler for GenerationHandler<S> {
    async fn handle(&self, job: &QueuedJob) -> Result<(), JobError> {
        let now = Utc::now();

        match job.decode()? {
            GenerationJob::Sweep => {
                self.service.sweep(now).await?;
            }
            GenerationJob::GenerateByTemplate {
                template,
                regenerate_since,
            } => {
                let outcome = self
                    .service
                    .generate_for_template(template.id, now, regenerate_since)
                    .await?;
                match outcome {
                    GenerationOutcome::Materialized(m) => tracing::info!(
                        job_id = %job.id,
                        template_id = %template.id,
                        inserted = m.inserted,
                        skipped = m.skipped,
                        "Generated instances"
                    ),
                    GenerationOutcome::UpToDate => tracing::debug!(
                        job_id = %job.id,
                        template_id = %template.id,
                        "Template already generated to horizon"
                    ),
                    GenerationOutcome::TemplateMissing => tracing::info!(
                        job_id = %job.id,
                        template_id = %template.id,
                        "Template no longer exists, dropping job"
                    ),
                }
            }
            GenerationJob::DeleteByTemplate { template_id } => {
                let deleted = self
                    .service
                    .delete_future_for_template(template_id, now, job.enqueued_at)
                    .await?;
                tracing::info!(
                    job_id = %job.id,
                    template_id = %template_id,
                    deleted,
                    "Deleted future instances"
                );
            }
        }
        Ok(())
    }
}
