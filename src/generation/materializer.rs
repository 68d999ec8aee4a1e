//! Writes expanded occurrences as task rows and advances the watermark.

use chrono::{DateTime, Utc};

use crate::core::task::NewTaskInstance;
use crate::core::template::RecurrenceTemplate;
use crate::storage::{InsertOutcome, StorageError, TaskRepository, TemplateRepository};

/// What one materialization wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeOutcome {
    /// New task rows.
    pub inserted: usize,
    /// Occurrences that already had a row.
    pub skipped: usize,
    /// Watermark written, if any occurrence was processed.
    pub watermark: Option<DateTime<Utc>>,
}

/// Inserts task instances for a template's occurrences.
///
/// Runs inside the caller's transaction and never commits it: on error the
/// caller rolls back, which discards every row written so far together with
/// the watermark update.
#[derive(Debug, Clone, Copy, Default)]
pub struct Materializer;

impl Materializer {
    pub fn new() -> Self {
        Self
    }

    /// Insert one instance per occurrence, then move the watermark to the
    /// greatest occurrence.
    ///
    /// `occurrences` must be ascending. An empty list writes nothing.
    pub async fn materialize<T>(
        &self,
        tx: &mut T,
        template: &RecurrenceTemplate,
        occurrences: &[DateTime<Utc>],
    ) -> Result<MaterializeOutcome, StorageError>
    where
        T: TemplateRepository + TaskRepository + ?Sized,
    {
        let Some(&last) = occurrences.last() else {
            return Ok(MaterializeOutcome::default());
        };

        let mut outcome = MaterializeOutcome::default();
        for &occurrence in occurrences {
            let task = NewTaskInstance::from_occurrence(template, occurrence);
            match tx.insert(&task).await? {
                InsertOutcome::Inserted(_) => outcome.inserted += 1,
                InsertOutcome::AlreadyPresent => outcome.skipped += 1,
            }
        }

        tx.update_watermark(template.id, last).await?;
        outcome.watermark = Some(last);

        tracing::debug!(
            template_id = %template.id,
            inserted = outcome.inserted,
            skipped = outcome.skipped,
            watermark = %last,
            "Materialized occurrences"
        );
        Ok(outcome)
    }
}
