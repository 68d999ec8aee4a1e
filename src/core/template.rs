//! Recurrence templates.
//!
//! A template is the persisted description of a repeating task: what to
//! create, when the series starts and the rule producing later occurrences.
//! It never owns the instances materialized from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{GoalId, TemplateId, UserId};

/// A persisted recurrence template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrenceTemplate {
    pub id: TemplateId,
    pub user_id: UserId,
    pub goal_id: GoalId,
    pub title: String,
    /// First occurrence of the series (rule DTSTART).
    pub anchor: DateTime<Utc>,
    /// Whether the anchor's time-of-day is meaningful.
    pub has_time: bool,
    pub duration_minutes: i32,
    /// RRULE text, e.g. `FREQ=WEEKLY;BYDAY=MO,WE,FR`.
    pub rule: String,
    /// Greatest occurrence materialized so far; `None` until the first run.
    pub last_generated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurrenceTemplate {
    /// Whether occurrences have ever been materialized for this template.
    pub fn has_generated(&self) -> bool {
        self.last_generated_at.is_some()
    }

    /// Whether the materialized range stops short of `horizon_end`.
    pub fn is_due(&self, horizon_end: DateTime<Utc>) -> bool {
        match self.last_generated_at {
            None => true,
            Some(watermark) => watermark < horizon_end,
        }
    }
}

/// Fields supplied when creating a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTemplate {
    pub user_id: UserId,
    pub goal_id: GoalId,
    pub title: String,
    pub anchor: DateTime<Utc>,
    pub has_time: bool,
    pub duration_minutes: i32,
    pub rule: String,
}

/// Replacement values for an existing template.
///
/// Updates replace every mutable field; ownership and the watermark are
/// not touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateChanges {
    pub goal_id: GoalId,
    pub title: String,
    pub anchor: DateTime<Utc>,
    pub has_time: bool,
    pub duration_minutes: i32,
    pub rule: String,
}

impl From<&RecurrenceTemplate> for TemplateChanges {
    fn from(template: &RecurrenceTemplate) -> Self {
        Self {
            goal_id: template.goal_id,
            title: template.title.clone(),
            anchor: template.anchor,
            has_time: template.has_time,
            duration_minutes: template.duration_minutes,
            rule: template.rule.clone(),
        }
    }
}
