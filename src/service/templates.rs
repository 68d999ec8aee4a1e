//! Template create, update and delete entry points.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::core::recurrence::{Recurrence, RecurrenceError};
use crate::core::task::TaskInstance;
use crate::core::template::{NewTemplate, RecurrenceTemplate, TemplateChanges};
use crate::core::types::{TemplateId, UserId};
use crate::jobs::{Dispatcher, EnqueueError};
use crate::storage::{StorageError, Store};

/// Errors returned by the template entry points.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// A field failed validation.
    #[error("invalid template: {0}")]
    Invalid(String),

    /// The rule does not parse against the anchor.
    #[error(transparent)]
    InvalidRule(#[from] RecurrenceError),

    /// No template with this id belongs to the caller.
    #[error("template not found: {0}")]
    NotFound(TemplateId),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The row was written but its follow-up job could not be enqueued.
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}

/// Validates template input, persists it and enqueues the generation jobs.
pub struct TemplateService<S: Store> {
    store: Arc<S>,
    dispatcher: Dispatcher,
}

impl<S: Store> TemplateService<S> {
    pub fn new(store: Arc<S>, dispatcher: Dispatcher) -> Self {
        Self { store, dispatcher }
    }

    /// Create a template and enqueue its first generation.
    pub async fn create(&self, template: NewTemplate) -> Result<RecurrenceTemplate, TemplateError> {
        validate(
            &template.title,
            template.duration_minutes,
            &template.rule,
            template.anchor,
        )?;

        let created = self.store.create_template(template).await?;
        tracing::info!(template_id = %created.id, user_id = %created.user_id, "Template created");

        self.dispatcher.template_created(&created).await?;
        Ok(created)
    }

    /// Replace a template's fields and enqueue cleanup plus regeneration.
    pub async fn update(
        &self,
        id: TemplateId,
        user_id: UserId,
        changes: TemplateChanges,
    ) -> Result<RecurrenceTemplate, TemplateError> {
        validate(
            &changes.title,
            changes.duration_minutes,
            &changes.rule,
            changes.anchor,
        )?;

        let updated = self
            .store
            .update_template(id, user_id, changes)
            .await
            .map_err(|e| not_found_or(e, id))?;
        tracing::info!(template_id = %id, "Template updated");

        self.dispatcher
            .template_updated(id, &updated, updated.updated_at)
            .await?;
        Ok(updated)
    }

    /// Delete a template and enqueue removal of its future instances.
    pub async fn delete(&self, id: TemplateId, user_id: UserId) -> Result<(), TemplateError> {
        self.store
            .delete_template(id, user_id)
            .await
            .map_err(|e| not_found_or(e, id))?;
        tracing::info!(template_id = %id, "Template deleted");

        self.dispatcher.template_deleted(id).await?;
        Ok(())
    }

    /// Load a template owned by `user_id`.
    pub async fn get(
        &self,
        id: TemplateId,
        user_id: UserId,
    ) -> Result<RecurrenceTemplate, TemplateError> {
        let template = self
            .store
            .find_template(id)
            .await
            .map_err(|e| not_found_or(e, id))?;
        if template.user_id != user_id {
            return Err(TemplateError::NotFound(id));
        }
        Ok(template)
    }

    pub async fn list(&self, user_id: UserId) -> Result<Vec<RecurrenceTemplate>, TemplateError> {
        Ok(self.store.list_templates(user_id).await?)
    }

    /// Instances materialized from a template owned by `user_id`.
    pub async fn tasks(
        &self,
        id: TemplateId,
        user_id: UserId,
    ) -> Result<Vec<TaskInstance>, TemplateError> {
        self.get(id, user_id).await?;
        Ok(self.store.list_tasks_for_template(id).await?)
    }
}

fn validate(
    title: &str,
    duration_minutes: i32,
    rule: &str,
    anchor: DateTime<Utc>,
) -> Result<(), TemplateError> {
    if title.trim().is_empty() {
        return Err(TemplateError::Invalid("title must not be empty".into()));
    }
    if duration_minutes < 0 {
        return Err(TemplateError::Invalid(format!(
            "duration must not be negative, got {}",
            duration_minutes
        )));
    }
    Recurrence::parse(rule, anchor)?;
    Ok(())
}

fn not_found_or(error: StorageError, id: TemplateId) -> TemplateError {
    if error.is_not_found() {
        TemplateError::NotFound(id)
    } else {
        TemplateError::Storage(error)
    }
}
