//! Persistent job queue with leases and a dead-letter state.
//!
//! Claiming a job leases it to one worker. The lease is released by
//! [`complete`](JobQueue::complete), [`retry`](JobQueue::retry) or
//! [`dead_letter`](JobQueue::dead_letter); a lease that simply expires is
//! handed back by [`requeue_expired`](JobQueue::requeue_expired), so every
//! job is delivered at least once.

mod memory;
mod sqlite;

pub use memory::InMemoryJobQueue;
pub use sqlite::SqliteJobQueue;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;
use thiserror::Error;

use super::{EncodedJob, GenerationJob, JobCodecError, QueueClass};
use crate::core::types::JobId;

/// Errors raised by a queue backend.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The job does not exist (already completed or never enqueued).
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Queue lock was poisoned.
    #[error("queue lock poisoned")]
    LockPoisoned,

    /// A stored record could not be decoded.
    #[error("corrupt queue record: {0}")]
    Corrupt(String),

    /// The backing store failed.
    #[error("queue storage error: {0}")]
    Storage(String),
}

/// Failure to put a job on the queue.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("failed to encode job: {0}")]
    Codec(#[from] JobCodecError),

    #[error("failed to enqueue job: {0}")]
    Queue(#[from] QueueError),
}

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting for its `run_at` and a free worker.
    Pending,
    /// Leased to a worker.
    Running,
    /// Gave up; kept for inspection and replay.
    Dead,
}

impl JobStatus {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Dead => "dead",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, QueueError> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "dead" => Ok(JobStatus::Dead),
            other => Err(QueueError::Corrupt(format!("unknown status: {}", other))),
        }
    }
}

/// A job as stored in the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: JobId,
    pub kind: String,
    pub payload: String,
    pub queue: QueueClass,
    pub status: JobStatus,
    /// Deliveries so far, including the current one.
    pub attempts: u32,
    pub run_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl QueuedJob {
    /// Decode the payload into a [`GenerationJob`].
    pub fn decode(&self) -> Result<GenerationJob, JobCodecError> {
        GenerationJob::decode(&self.kind, &self.payload)
    }
}

/// Where and when a job should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub queue: QueueClass,
    pub delay: Duration,
}

impl EnqueueOptions {
    /// Run on `queue` as soon as a worker is free.
    pub fn on(queue: QueueClass) -> Self {
        Self {
            queue,
            delay: Duration::ZERO,
        }
    }

    /// Hold the job back for `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub dead: usize,
}

/// Queue backend used by the dispatcher and the worker pool.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Store an encoded job, ready at `now + options.delay`.
    async fn push(
        &self,
        job: EncodedJob,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<JobId, QueueError>;

    /// Lease the oldest ready job of `queue`, if any.
    ///
    /// Increments the job's attempt counter.
    async fn claim(
        &self,
        queue: QueueClass,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<QueuedJob>, QueueError>;

    /// Remove a successfully handled job.
    async fn complete(&self, id: JobId) -> Result<(), QueueError>;

    /// Release a failed job for another delivery at `run_at`.
    async fn retry(&self, id: JobId, run_at: DateTime<Utc>, error: &str)
    -> Result<(), QueueError>;

    /// Park a job in the dead-letter state.
    async fn dead_letter(&self, id: JobId, error: &str) -> Result<(), QueueError>;

    /// Return jobs whose lease expired before `now` to the pending state.
    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError>;

    /// Dead-lettered jobs, oldest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueuedJob>, QueueError>;

    /// Move a dead-lettered job back to pending with a fresh attempt budget.
    async fn replay(&self, id: JobId, now: DateTime<Utc>) -> Result<(), QueueError>;

    /// Counts by status.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Encode and push `job`.
    async fn enqueue(
        &self,
        job: &GenerationJob,
        options: EnqueueOptions,
    ) -> Result<JobId, EnqueueError> {
        let encoded = job.encode()?;
        Ok(self.push(encoded, options, Utc::now()).await?)
    }
}

/// `now + delay`, saturating at the largest representable instant.
pub(crate) fn offset(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_enqueue_options_builder() {
        let opts = EnqueueOptions::on(QueueClass::Critical).delayed(Duration::from_secs(1));

        assert_eq!(opts.queue, QueueClass::Critical);
        assert_eq!(opts.delay, Duration::from_secs(1));
        assert_eq!(EnqueueOptions::on(QueueClass::Low).delay, Duration::ZERO);
    }

    #[test]
    fn test_offset_saturates() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        assert_eq!(
            offset(now, Duration::from_millis(1500)),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 1).unwrap() + TimeDelta::milliseconds(500)
        );
        assert_eq!(offset(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_status_names() {
        for status in [JobStatus::Pending, JobStatus::Running, JobStatus::Dead] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::parse("done").is_err());
    }
}
