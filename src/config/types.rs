//! Configuration type definitions.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! working configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::recurrence::{DEFAULT_HORIZON_MONTHS, Expander};
use crate::core::retry::RetryPolicy;
use crate::core::schedule::{Schedule, ScheduleError};
use crate::worker::{QueueWeights, WorkerConfig};

/// Database path used when none is configured.
pub const DEFAULT_DATABASE: &str = "rekur.db";

/// Path selecting a private in-memory database.
pub const IN_MEMORY_DATABASE: &str = ":memory:";

/// Application configuration (rekur.yaml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite database path, or `:memory:`.
    pub database: String,
    /// Rolling horizon in calendar months.
    pub horizon_months: u32,
    pub workers: WorkersConfig,
    /// Retry policy for failed jobs.
    pub retry: RetryPolicy,
    pub sweep: SweepConfig,
    pub dispatch: DispatchConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_string(),
            horizon_months: DEFAULT_HORIZON_MONTHS,
            workers: WorkersConfig::default(),
            retry: RetryPolicy::default(),
            sweep: SweepConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl AppConfig {
    /// Whether the database lives only in memory.
    pub fn is_in_memory(&self) -> bool {
        self.database == IN_MEMORY_DATABASE
    }

    pub fn expander(&self) -> Expander {
        Expander::new(self.horizon_months)
    }

    /// Worker pool settings, retry policy included.
    pub fn worker_config(&self) -> WorkerConfig {
        let w = &self.workers;
        WorkerConfig {
            concurrency: w.concurrency,
            weights: w.queues,
            poll_interval: Duration::from_millis(w.poll_interval_ms),
            lease: Duration::from_secs(w.lease_secs),
            job_timeout: Duration::from_secs(w.job_timeout_secs),
            reap_interval: Duration::from_secs(w.reap_interval_secs),
            shutdown_timeout: Duration::from_secs(w.shutdown_timeout_secs),
            retry: self.retry.clone(),
        }
    }

    /// The parsed sweep trigger.
    pub fn sweep_schedule(&self) -> Result<Schedule, ScheduleError> {
        Schedule::with_timezone(&self.sweep.schedule, &self.sweep.timezone)
    }

    pub fn regenerate_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch.regenerate_delay_ms)
    }
}

/// Worker pool section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub concurrency: usize,
    /// Claim weights per queue class.
    pub queues: QueueWeights,
    pub poll_interval_ms: u64,
    pub lease_secs: u64,
    pub job_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        let defaults = WorkerConfig::default();
        Self {
            concurrency: defaults.concurrency,
            queues: defaults.weights,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            lease_secs: defaults.lease.as_secs(),
            job_timeout_secs: defaults.job_timeout.as_secs(),
            reap_interval_secs: defaults.reap_interval.as_secs(),
            shutdown_timeout_secs: defaults.shutdown_timeout.as_secs(),
        }
    }
}

/// Periodic sweep section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Cron expression or shortcut.
    pub schedule: String,
    /// IANA timezone the schedule is evaluated in.
    pub timezone: String,
    /// Bound on waiting for an in-flight trigger at shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            schedule: "@daily".to_string(),
            timezone: "UTC".to_string(),
            shutdown_timeout_secs: 10,
        }
    }
}

/// Job dispatch section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Delay of the regenerate job behind the delete job on update.
    pub regenerate_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            regenerate_delay_ms: 1_000,
        }
    }
}
