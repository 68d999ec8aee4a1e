//! Task instances materialized from templates.

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::template::RecurrenceTemplate;
use super::types::{GoalId, TaskInstanceId, TemplateId, UserId};

const MICROS_PER_SECOND: i64 = 1_000_000;

/// A concrete, individually schedulable task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: TaskInstanceId,
    pub user_id: UserId,
    pub goal_id: GoalId,
    /// Weak back-reference; plain tasks have none.
    pub template_id: Option<TemplateId>,
    pub title: String,
    pub scheduled_date: NaiveDate,
    /// Time of day, present only when `has_time` is set.
    pub scheduled_time: Option<NaiveTime>,
    pub has_time: bool,
    pub duration_minutes: i32,
    pub is_done: bool,
    pub reschedule_count: i32,
    /// The occurrence this row was materialized from.
    pub occurs_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A task row ready to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTaskInstance {
    pub user_id: UserId,
    pub goal_id: GoalId,
    pub template_id: Option<TemplateId>,
    pub title: String,
    pub scheduled_date: NaiveDate,
    pub scheduled_time: Option<NaiveTime>,
    pub has_time: bool,
    pub duration_minutes: i32,
    pub is_done: bool,
    pub reschedule_count: i32,
    pub occurs_at: Option<DateTime<Utc>>,
}

impl NewTaskInstance {
    /// Build the row for one occurrence of `template`.
    ///
    /// The instance inherits owner, goal, title, has-time and duration; it
    /// starts not done and never rescheduled.
    pub fn from_occurrence(template: &RecurrenceTemplate, occurrence: DateTime<Utc>) -> Self {
        let scheduled_time = template.has_time.then(|| occurrence.time());

        Self {
            user_id: template.user_id,
            goal_id: template.goal_id,
            template_id: Some(template.id),
            title: template.title.clone(),
            scheduled_date: occurrence.date_naive(),
            scheduled_time,
            has_time: template.has_time,
            duration_minutes: template.duration_minutes,
            is_done: false,
            reschedule_count: 0,
            occurs_at: Some(occurrence),
        }
    }
}

/// Time of day as microseconds since midnight.
pub fn time_to_micros(time: NaiveTime) -> i64 {
    i64::from(time.num_seconds_from_midnight()) * MICROS_PER_SECOND
        + i64::from(time.nanosecond() / 1_000)
}

/// Inverse of [`time_to_micros`]. Returns `None` outside a single day.
pub fn micros_to_time(micros: i64) -> Option<NaiveTime> {
    if !(0..86_400 * MICROS_PER_SECOND).contains(&micros) {
        return None;
    }
    let secs = u32::try_from(micros / MICROS_PER_SECOND).ok()?;
    let nanos = u32::try_from(micros % MICROS_PER_SECOND).ok()? * 1_000;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
}
