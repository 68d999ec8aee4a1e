//! Storage abstraction for templates and task instances.
//!
//! Generation code only sees the narrow repository traits below, always
//! through a [`Transaction`] obtained from a [`Store`]. Template CRUD used by
//! the entry points runs outside of generation transactions.

pub(crate) mod sqlite;

pub use sqlite::{SqliteStore, SqliteTx};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::task::{NewTaskInstance, TaskInstance};
use crate::core::template::{NewTemplate, RecurrenceTemplate, TemplateChanges};
use crate::core::types::{TaskInstanceId, TemplateId, UserId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// A stored value could not be decoded.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether this is a missing-row error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Result of inserting one task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written.
    Inserted(TaskInstanceId),
    /// The occurrence was already materialized; nothing was written.
    AlreadyPresent,
}

/// Template reads and watermark writes inside a transaction.
#[async_trait]
pub trait TemplateRepository: Send {
    /// Load a template by id.
    async fn get(&mut self, id: TemplateId) -> Result<RecurrenceTemplate, StorageError>;

    /// Templates never generated, or whose watermark is before `horizon_end`.
    async fn list_due(
        &mut self,
        horizon_end: DateTime<Utc>,
    ) -> Result<Vec<RecurrenceTemplate>, StorageError>;

    /// Move the watermark forward to `watermark`. Never moves it backwards.
    async fn update_watermark(
        &mut self,
        id: TemplateId,
        watermark: DateTime<Utc>,
    ) -> Result<(), StorageError>;
}

/// Task instance writes inside a transaction.
#[async_trait]
pub trait TaskRepository: Send {
    /// Insert one instance, ignoring an already materialized occurrence.
    async fn insert(&mut self, task: &NewTaskInstance) -> Result<InsertOutcome, StorageError>;

    /// Delete not-completed instances of `template_id` occurring at or after
    /// `now`. With `created_before`, rows written at or after that instant
    /// are kept.
    async fn delete_future_by_template_id(
        &mut self,
        template_id: TemplateId,
        now: DateTime<Utc>,
        created_before: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError>;
}

/// A unit of work. Dropping it without [`commit`](Transaction::commit) rolls back.
#[async_trait]
pub trait Transaction: TemplateRepository + TaskRepository + Send {
    /// Make every write of this scope durable.
    async fn commit(self) -> Result<(), StorageError>;

    /// Discard every write of this scope.
    async fn rollback(self) -> Result<(), StorageError>;
}

/// Entry point to the relational store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Transaction type handed to generation code.
    type Tx: Transaction;

    /// Open a transaction scope.
    async fn begin(&self) -> Result<Self::Tx, StorageError>;

    /// Persist a new template and return it with its assigned id.
    async fn create_template(
        &self,
        template: NewTemplate,
    ) -> Result<RecurrenceTemplate, StorageError>;

    /// Replace the mutable fields of a template owned by `user_id`.
    async fn update_template(
        &self,
        id: TemplateId,
        user_id: UserId,
        changes: TemplateChanges,
    ) -> Result<RecurrenceTemplate, StorageError>;

    /// Delete a template owned by `user_id`. Its instances are left in place.
    async fn delete_template(&self, id: TemplateId, user_id: UserId) -> Result<(), StorageError>;

    /// Load a template by id.
    async fn find_template(&self, id: TemplateId) -> Result<RecurrenceTemplate, StorageError>;

    /// Templates owned by `user_id`, oldest first.
    async fn list_templates(
        &self,
        user_id: UserId,
    ) -> Result<Vec<RecurrenceTemplate>, StorageError>;

    /// Instances referencing `template_id`, ordered by occurrence.
    async fn list_tasks_for_template(
        &self,
        template_id: TemplateId,
    ) -> Result<Vec<TaskInstance>, StorageError>;
}
