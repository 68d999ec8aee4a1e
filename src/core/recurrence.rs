//! Recurrence rule parsing and windowed expansion.
//!
//! Rules are RRULE text interpreted with the template anchor as DTSTART.
//! Expansion is incremental: each run covers the open interval between the
//! template's watermark and a rolling horizon, so an occurrence that was
//! already materialized is never produced twice.

use chrono::{DateTime, Months, TimeDelta, Utc};
use rrule::{RRule, RRuleSet, Tz, Unvalidated};
use std::fmt;
use thiserror::Error;

use super::template::RecurrenceTemplate;

/// Default rolling horizon, in calendar months past "now".
pub const DEFAULT_HORIZON_MONTHS: u32 = 3;

/// Upper bound on occurrences produced by a single expansion.
pub const MAX_OCCURRENCES_PER_RUN: u16 = u16::MAX;

/// Lower-bound offset used for templates that were never generated, so the
/// anchor itself is inside the exclusive window.
const ANCHOR_EPSILON_SECS: i64 = 1;

const RRULE_PREFIX: &str = "RRULE:";

/// Errors raised while interpreting a recurrence rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecurrenceError {
    /// The rule text is empty.
    #[error("recurrence rule is empty")]
    Empty,

    /// The rule text could not be parsed or validated against its anchor.
    #[error("invalid recurrence rule '{rule}': {reason}")]
    Parse { rule: String, reason: String },
}

impl RecurrenceError {
    fn parse(rule: &str, reason: impl fmt::Display) -> Self {
        Self::Parse {
            rule: rule.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A parsed rule bound to its anchor instant.
#[derive(Clone)]
pub struct Recurrence {
    rule: String,
    set: RRuleSet,
}

/// Occurrences returned by one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Occurrences {
    /// Strictly ascending instants.
    pub instants: Vec<DateTime<Utc>>,
    /// Set when the per-run cap stopped the expansion early.
    pub truncated: bool,
}

impl Recurrence {
    /// Parse `rule` with `anchor` as the series start.
    ///
    /// Accepts the bare rule (`FREQ=DAILY`) or the property form
    /// (`RRULE:FREQ=DAILY`).
    pub fn parse(rule: &str, anchor: DateTime<Utc>) -> Result<Self, RecurrenceError> {
        let trimmed = rule.trim();
        let body = trimmed.strip_prefix(RRULE_PREFIX).unwrap_or(trimmed);
        if body.is_empty() {
            return Err(RecurrenceError::Empty);
        }

        let unvalidated: RRule<Unvalidated> = body
            .parse()
            .map_err(|e| RecurrenceError::parse(trimmed, e))?;
        let set = unvalidated
            .build(anchor.with_timezone(&Tz::UTC))
            .map_err(|e| RecurrenceError::parse(trimmed, e))?;

        Ok(Self {
            rule: trimmed.to_string(),
            set,
        })
    }

    /// The rule text as parsed.
    pub fn rule(&self) -> &str {
        &self.rule
    }

    /// Occurrences `o` with `after < o < before`, at most `limit` of them.
    pub fn between(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        limit: u16,
    ) -> Occurrences {
        if after >= before || limit == 0 {
            return Occurrences::default();
        }

        let result = self
            .set
            .clone()
            .after(after.with_timezone(&Tz::UTC))
            .before(before.with_timezone(&Tz::UTC))
            .all(limit);

        let instants = result
            .dates
            .into_iter()
            .map(|dt| dt.with_timezone(&Utc))
            .filter(|dt| *dt > after && *dt < before)
            .collect();

        Occurrences {
            instants,
            truncated: result.limited,
        }
    }

    /// The first `count` occurrences of the series.
    pub fn first(&self, count: u16) -> Vec<DateTime<Utc>> {
        self.set
            .clone()
            .all(count)
            .dates
            .into_iter()
            .map(|dt| dt.with_timezone(&Utc))
            .collect()
    }
}

impl fmt::Debug for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recurrence").field("rule", &self.rule).finish()
    }
}

/// Validate `rule` against `anchor` and return its first `count` occurrences.
pub fn preview(
    rule: &str,
    anchor: DateTime<Utc>,
    count: u16,
) -> Result<Vec<DateTime<Utc>>, RecurrenceError> {
    Ok(Recurrence::parse(rule, anchor)?.first(count))
}

/// Open interval `(after, before)` covered by one expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionWindow {
    pub after: DateTime<Utc>,
    pub before: DateTime<Utc>,
}

impl ExpansionWindow {
    /// Whether the window contains no instant.
    pub fn is_empty(&self) -> bool {
        self.after >= self.before
    }
}

/// Result of expanding one template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub window: ExpansionWindow,
    pub occurrences: Vec<DateTime<Utc>>,
    pub truncated: bool,
}

/// Computes the occurrences a template still needs materialized.
#[derive(Debug, Clone, Copy)]
pub struct Expander {
    horizon_months: u32,
    max_occurrences: u16,
}

impl Default for Expander {
    fn default() -> Self {
        Self::new(DEFAULT_HORIZON_MONTHS)
    }
}

impl Expander {
    /// Create an expander with a horizon of `horizon_months` calendar months.
    pub fn new(horizon_months: u32) -> Self {
        Self {
            horizon_months,
            max_occurrences: MAX_OCCURRENCES_PER_RUN,
        }
    }

    /// Cap the number of occurrences produced per expansion.
    pub fn with_max_occurrences(mut self, max: u16) -> Self {
        self.max_occurrences = max;
        self
    }

    /// Horizon length in months.
    pub fn horizon_months(&self) -> u32 {
        self.horizon_months
    }

    /// Exclusive end of the materialization range as seen from `now`.
    pub fn horizon_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_months(Months::new(self.horizon_months))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Window still to be covered for `template`.
    ///
    /// The lower bound is the watermark, or one epsilon before the anchor
    /// when nothing was generated yet. `since` can only lower it, which is
    /// how a regeneration re-covers a range already past the watermark.
    pub fn window(
        &self,
        template: &RecurrenceTemplate,
        now: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
    ) -> ExpansionWindow {
        let base = match template.last_generated_at {
            Some(watermark) => watermark,
            None => template.anchor - TimeDelta::seconds(ANCHOR_EPSILON_SECS),
        };
        let after = match since {
            Some(since) => base.min(since),
            None => base,
        };

        ExpansionWindow {
            after,
            before: self.horizon_end(now),
        }
    }

    /// Expand `template` over its pending window.
    ///
    /// Fails with [`RecurrenceError`] before anything is written when the
    /// rule does not parse against the anchor.
    pub fn expand(
        &self,
        template: &RecurrenceTemplate,
        now: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Expansion, RecurrenceError> {
        let recurrence = Recurrence::parse(&template.rule, template.anchor)?;
        let window = self.window(template, now, since);
        let Occurrences {
            instants,
            truncated,
        } = recurrence.between(window.after, window.before, self.max_occurrences);

        if truncated {
            tracing::warn!(
                template_id = %template.id,
                produced = instants.len(),
                "Expansion hit the per-run cap, remaining occurrences deferred to the next run"
            );
        }

        Ok(Expansion {
            window,
            occurrences: instants,
            truncated,
        })
    }
}
