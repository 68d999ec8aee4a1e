//! Transactional materialization of recurrence templates.
//!
//! [`GenerationService`] owns the transaction scopes: one per
//! generate-by-template job, one per template during a sweep and one per
//! delete-by-template job. [`Materializer`] does the writes inside them.

pub mod materializer;
pub mod service;

pub use materializer::{MaterializeOutcome, Materializer};
pub use service::{GenerationOutcome, GenerationService, SweepReport};

use thiserror::Error;

use crate::core::recurrence::RecurrenceError;
use crate::core::types::TemplateId;
use crate::storage::StorageError;

/// Errors raised while generating or deleting instances.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The template's rule does not parse against its anchor.
    #[error("template {template_id}: {source}")]
    Recurrence {
        template_id: TemplateId,
        #[source]
        source: RecurrenceError,
    },

    /// Storage failure; the transaction was rolled back.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl GenerationError {
    /// Whether retrying cannot succeed without a change to the data.
    pub fn is_permanent(&self) -> bool {
        match self {
            GenerationError::Recurrence { .. } => true,
            GenerationError::Storage(StorageError::SerializationError(_)) => true,
            GenerationError::Storage(_) => false,
        }
    }
}
