//! Generation entry points run by the worker pool.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;

use super::GenerationError;
use super::materializer::{MaterializeOutcome, Materializer};
use crate::core::recurrence::Expander;
use crate::core::template::RecurrenceTemplate;
use crate::core::types::TemplateId;
use crate::storage::{Store, TaskRepository, TemplateRepository, Transaction};

/// Result of generating one template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Occurrences were expanded and written.
    Materialized(MaterializeOutcome),
    /// The window held no occurrence; nothing was written.
    UpToDate,
    /// The template no longer exists. Stale jobs end here.
    TemplateMissing,
}

impl GenerationOutcome {
    /// Rows inserted by this run.
    pub fn inserted(&self) -> usize {
        match self {
            GenerationOutcome::Materialized(outcome) => outcome.inserted,
            _ => 0,
        }
    }
}

/// Summary of a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Templates listed as due.
    pub due: usize,
    /// Templates that received at least one new row.
    pub materialized: usize,
    /// Rows inserted across all templates.
    pub inserted: usize,
    /// Templates that failed; their writes were rolled back.
    pub failed: Vec<TemplateId>,
}

/// Runs expansion and materialization inside transaction scopes.
pub struct GenerationService<S: Store> {
    store: Arc<S>,
    expander: Expander,
    materializer: Materializer,
}

impl<S: Store> GenerationService<S> {
    /// Create a service over `store` using `expander`'s horizon.
    pub fn new(store: Arc<S>, expander: Expander) -> Self {
        Self {
            store,
            expander,
            materializer: Materializer::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn expander(&self) -> &Expander {
        &self.expander
    }

    /// Materialize one template in its own transaction.
    ///
    /// The template is reloaded inside the transaction, so a stale snapshot
    /// never drives the write. `since` lowers the window's start bound; the
    /// update path passes the update instant to refill the future schedule.
    /// A regeneration first removes the open instances it is about to
    /// rewrite, so the result does not depend on whether the cleanup job ran
    /// before it.
    pub async fn generate_for_template(
        &self,
        template_id: TemplateId,
        now: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
    ) -> Result<GenerationOutcome, GenerationError> {
        let mut tx = self.store.begin().await?;

        let template = match tx.get(template_id).await {
            Ok(template) => template,
            Err(e) if e.is_not_found() => {
                tx.rollback().await?;
                tracing::debug!(template_id = %template_id, "Template gone, nothing to generate");
                return Ok(GenerationOutcome::TemplateMissing);
            }
            Err(e) => return Err(e.into()),
        };

        match self.generate_in(&mut tx, &template, now, since).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(
                        template_id = %template_id,
                        error = %rollback_err,
                        "Rollback failed after generation error"
                    );
                }
                Err(e)
            }
        }
    }

    async fn generate_in(
        &self,
        tx: &mut S::Tx,
        template: &RecurrenceTemplate,
        now: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
    ) -> Result<GenerationOutcome, GenerationError> {
        let expansion = self
            .expander
            .expand(template, now, since)
            .map_err(|source| GenerationError::Recurrence {
                template_id: template.id,
                source,
            })?;

        if let Some(since) = since {
            // Only rows inside the regenerated window, i.e. after `since`.
            let clear_from = now.max(since + TimeDelta::milliseconds(1));
            let cleared = tx
                .delete_future_by_template_id(template.id, clear_from, None)
                .await?;
            tracing::debug!(
                template_id = %template.id,
                cleared,
                "Cleared open instances before regeneration"
            );
        }

        if expansion.occurrences.is_empty() {
            return Ok(GenerationOutcome::UpToDate);
        }

        let outcome = self
            .materializer
            .materialize(tx, template, &expansion.occurrences)
            .await?;
        Ok(GenerationOutcome::Materialized(outcome))
    }

    /// Materialize every template whose watermark is short of the horizon.
    ///
    /// Each template gets its own transaction. A failing template is logged
    /// and skipped; only listing the due templates can fail the sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, GenerationError> {
        let horizon_end = self.expander.horizon_end(now);

        let due = {
            let mut tx = self.store.begin().await?;
            let due = tx.list_due(horizon_end).await?;
            tx.commit().await?;
            due
        };

        let mut report = SweepReport {
            due: due.len(),
            ..SweepReport::default()
        };

        for template in &due {
            match self.generate_for_template(template.id, now, None).await {
                Ok(outcome) => {
                    let inserted = outcome.inserted();
                    if inserted > 0 {
                        report.materialized += 1;
                        report.inserted += inserted;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        template_id = %template.id,
                        error = %e,
                        "Skipping template during sweep"
                    );
                    report.failed.push(template.id);
                }
            }
        }

        tracing::info!(
            due = report.due,
            materialized = report.materialized,
            inserted = report.inserted,
            failed = report.failed.len(),
            "Sweep finished"
        );
        Ok(report)
    }

    /// Delete the not-completed instances of `template_id` occurring at or
    /// after `now` that were written before `created_before`.
    ///
    /// The delete job passes its enqueue instant, so rows a regeneration
    /// wrote after the job was queued survive a late cleanup.
    pub async fn delete_future_for_template(
        &self,
        template_id: TemplateId,
        now: DateTime<Utc>,
        created_before: DateTime<Utc>,
    ) -> Result<u64, GenerationError> {
        let mut tx = self.store.begin().await?;
        let deleted = tx
            .delete_future_by_template_id(template_id, now, Some(created_before))
            .await?;
        tx.commit().await?;

        tracing::debug!(template_id = %template_id, deleted, "Deleted future instances");
        Ok(deleted)
    }
}
