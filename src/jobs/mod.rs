//! Generation jobs and their queue wire format.
//!
//! Jobs travel through the queue as `{type, payload}` pairs. The type
//! strings are stable identifiers shared with anything else reading the
//! queue; payloads are JSON.

pub mod dispatcher;
pub mod queue;

pub use dispatcher::Dispatcher;
pub use queue::{
    EnqueueError, EnqueueOptions, InMemoryJobQueue, JobQueue, JobStatus, QueueError, QueueStats,
    QueuedJob, SqliteJobQueue,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::core::template::RecurrenceTemplate;
use crate::core::types::TemplateId;

/// Type identifier of the periodic sweep job.
pub const TYPE_SWEEP: &str = "generate:recurring:tasks:due:for:generation";

/// Type identifier of the single-template generation job.
pub const TYPE_GENERATE_BY_TEMPLATE: &str = "generate:recurring:tasks:by:template";

/// Type identifier of the future-instance deletion job.
pub const TYPE_DELETE_BY_TEMPLATE: &str = "delete:recurring:tasks:by:template:id";

/// Errors encoding or decoding a job payload.
#[derive(Debug, Error)]
pub enum JobCodecError {
    /// The type string names no known job.
    #[error("unknown job type: {0}")]
    UnknownType(String),

    /// The payload does not match the job type.
    #[error("invalid payload for {kind}: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A unit of asynchronous generation work.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationJob {
    /// Materialize every template that is due.
    Sweep,

    /// Materialize one template.
    GenerateByTemplate {
        /// Snapshot of the template at enqueue time.
        template: RecurrenceTemplate,
        /// Re-expand from no later than this instant (set on regeneration).
        regenerate_since: Option<DateTime<Utc>>,
    },

    /// Remove the future, not completed instances of a template.
    DeleteByTemplate { template_id: TemplateId },
}

#[derive(Serialize, Deserialize)]
struct GeneratePayload {
    #[serde(flatten)]
    template: RecurrenceTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    regenerate_since: Option<DateTime<Utc>>,
}

/// A job in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedJob {
    pub kind: String,
    pub payload: String,
}

impl GenerationJob {
    /// Stable type identifier.
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationJob::Sweep => TYPE_SWEEP,
            GenerationJob::GenerateByTemplate { .. } => TYPE_GENERATE_BY_TEMPLATE,
            GenerationJob::DeleteByTemplate { .. } => TYPE_DELETE_BY_TEMPLATE,
        }
    }

    /// The template this job concerns, if any.
    pub fn template_id(&self) -> Option<TemplateId> {
        match self {
            GenerationJob::Sweep => None,
            GenerationJob::GenerateByTemplate { template, .. } => Some(template.id),
            GenerationJob::DeleteByTemplate { template_id } => Some(*template_id),
        }
    }

    /// Serialize to wire form.
    pub fn encode(&self) -> Result<EncodedJob, JobCodecError> {
        let kind = self.kind();
        let payload = match self {
            GenerationJob::Sweep => String::new(),
            GenerationJob::GenerateByTemplate {
                template,
                regenerate_since,
            } => serde_json::to_string(&GeneratePayload {
                template: template.clone(),
                regenerate_since: *regenerate_since,
            })
            .map_err(|source| JobCodecError::Payload { kind, source })?,
            GenerationJob::DeleteByTemplate { template_id } => serde_json::to_string(template_id)
                .map_err(|source| JobCodecError::Payload { kind, source })?,
        };

        Ok(EncodedJob {
            kind: kind.to_string(),
            payload,
        })
    }

    /// Parse a job from its type string and payload.
    pub fn decode(kind: &str, payload: &str) -> Result<Self, JobCodecError> {
        match kind {
            TYPE_SWEEP => Ok(GenerationJob::Sweep),
            TYPE_GENERATE_BY_TEMPLATE => {
                let parsed: GeneratePayload =
                    serde_json::from_str(payload).map_err(|source| JobCodecError::Payload {
                        kind: TYPE_GENERATE_BY_TEMPLATE,
                        source,
                    })?;
                Ok(GenerationJob::GenerateByTemplate {
                    template: parsed.template,
                    regenerate_since: parsed.regenerate_since,
                })
            }
            TYPE_DELETE_BY_TEMPLATE => {
                let template_id =
                    serde_json::from_str(payload).map_err(|source| JobCodecError::Payload {
                        kind: TYPE_DELETE_BY_TEMPLATE,
                        source,
                    })?;
                Ok(GenerationJob::DeleteByTemplate { template_id })
            }
            other => Err(JobCodecError::UnknownType(other.to_string())),
        }
    }
}

/// Priority class of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
    Critical,
    Default,
    Low,
}

impl QueueClass {
    /// All classes, highest priority first.
    pub const ALL: [QueueClass; 3] = [QueueClass::Critical, QueueClass::Default, QueueClass::Low];

    /// Queue name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueClass::Critical => "critical",
            QueueClass::Default => "default",
            QueueClass::Low => "low",
        }
    }
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(QueueClass::Critical),
            "default" => Ok(QueueClass::Default),
            "low" => Ok(QueueClass::Low),
            other => Err(format!("unknown queue: {}", other)),
        }
    }
}
