//! In-memory job queue.
//!
//! Same semantics as the SQLite queue without durability; used in tests and
//! for dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use super::{EnqueueOptions, JobQueue, JobStatus, QueueError, QueueStats, QueuedJob, offset};
use crate::core::types::JobId;
use crate::jobs::{EncodedJob, QueueClass};

struct Entry {
    job: QueuedJob,
    lease_expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    /// Keyed by enqueue sequence, which breaks `run_at` ties in FIFO order.
    entries: BTreeMap<u64, Entry>,
    next_seq: u64,
}

impl State {
    fn find_mut(&mut self, id: JobId) -> Result<&mut Entry, QueueError> {
        self.entries
            .values_mut()
            .find(|entry| entry.job.id == id)
            .ok_or(QueueError::NotFound(id))
    }
}

/// In-memory queue backend.
///
/// Thread-safe via RwLock; nothing survives a restart.
#[derive(Default)]
pub struct InMemoryJobQueue {
    state: RwLock<State>,
}

impl InMemoryJobQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored job, in enqueue order.
    pub fn jobs(&self) -> Result<Vec<QueuedJob>, QueueError> {
        let state = self.state.read().map_err(|_| QueueError::LockPoisoned)?;
        Ok(state.entries.values().map(|e| e.job.clone()).collect())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn push(
        &self,
        job: EncodedJob,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<JobId, QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        let id = JobId::new();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            seq,
            Entry {
                job: QueuedJob {
                    id,
                    kind: job.kind,
                    payload: job.payload,
                    queue: options.queue,
                    status: JobStatus::Pending,
                    attempts: 0,
                    run_at: offset(now, options.delay),
                    enqueued_at: now,
                    last_error: None,
                },
                lease_expires_at: None,
            },
        );
        Ok(id)
    }

    async fn claim(
        &self,
        queue: QueueClass,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<QueuedJob>, QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        let next = state
            .entries
            .iter()
            .filter(|(_, e)| {
                e.job.queue == queue && e.job.status == JobStatus::Pending && e.job.run_at <= now
            })
            .min_by_key(|(seq, e)| (e.job.run_at, **seq))
            .map(|(seq, _)| *seq);

        let Some(seq) = next else {
            return Ok(None);
        };
        let Some(entry) = state.entries.get_mut(&seq) else {
            return Ok(None);
        };
        entry.job.status = JobStatus::Running;
        entry.job.attempts += 1;
        entry.lease_expires_at = Some(offset(now, lease));
        Ok(Some(entry.job.clone()))
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        let seq = state
            .entries
            .iter()
            .find(|(_, e)| e.job.id == id)
            .map(|(seq, _)| *seq)
            .ok_or(QueueError::NotFound(id))?;
        state.entries.remove(&seq);
        Ok(())
    }

    async fn retry(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        let entry = state.find_mut(id)?;
        entry.job.status = JobStatus::Pending;
        entry.job.run_at = run_at;
        entry.job.last_error = Some(error.to_string());
        entry.lease_expires_at = None;
        Ok(())
    }

    async fn dead_letter(&self, id: JobId, error: &str) -> Result<(), QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        let entry = state.find_mut(id)?;
        entry.job.status = JobStatus::Dead;
        entry.job.last_error = Some(error.to_string());
        entry.lease_expires_at = None;
        Ok(())
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        let mut requeued = 0;
        for entry in state.entries.values_mut() {
            let expired = entry.job.status == JobStatus::Running
                && entry.lease_expires_at.is_some_and(|at| at <= now);
            if expired {
                entry.job.status = JobStatus::Pending;
                entry.lease_expires_at = None;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueuedJob>, QueueError> {
        let state = self.state.read().map_err(|_| QueueError::LockPoisoned)?;
        Ok(state
            .entries
            .values()
            .filter(|e| e.job.status == JobStatus::Dead)
            .take(limit)
            .map(|e| e.job.clone())
            .collect())
    }

    async fn replay(&self, id: JobId, now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut state = self.state.write().map_err(|_| QueueError::LockPoisoned)?;
        let entry = state.find_mut(id)?;
        if entry.job.status != JobStatus::Dead {
            return Err(QueueError::NotFound(id));
        }
        entry.job.status = JobStatus::Pending;
        entry.job.attempts = 0;
        entry.job.run_at = now;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.read().map_err(|_| QueueError::LockPoisoned)?;
        let mut stats = QueueStats::default();
        for entry in state.entries.values() {
            match entry.job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }
}
