//! SQLite-backed job queue sharing the store's database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteQueryResult};
use std::str::FromStr;
use std::time::Duration;

use super::{EnqueueOptions, JobQueue, JobStatus, QueueError, QueueStats, QueuedJob, offset};
use crate::core::types::JobId;
use crate::jobs::{EncodedJob, QueueClass};
use crate::storage::SqliteStore;
use crate::storage::sqlite::{from_millis, to_millis};

const JOB_COLUMNS: &str =
    "id, kind, payload, queue, status, attempts, run_at, enqueued_at, last_error";

type JobRow = (
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    i64,
    Option<String>,
);

fn queue_error(e: sqlx::Error) -> QueueError {
    QueueError::Storage(e.to_string())
}

fn job_from_row(row: JobRow) -> Result<QueuedJob, QueueError> {
    let id = JobId::from_str(&row.0).map_err(|e| QueueError::Corrupt(e.to_string()))?;
    let queue = QueueClass::from_str(&row.3).map_err(QueueError::Corrupt)?;
    let attempts = u32::try_from(row.5).map_err(|e| QueueError::Corrupt(e.to_string()))?;
    let time = |millis| from_millis(millis).map_err(|e| QueueError::Corrupt(e.to_string()));

    Ok(QueuedJob {
        id,
        kind: row.1,
        payload: row.2,
        queue,
        status: JobStatus::parse(&row.4)?,
        attempts,
        run_at: time(row.6)?,
        enqueued_at: time(row.7)?,
        last_error: row.8,
    })
}

/// Durable queue stored in the `job_queue` table.
#[derive(Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
}

impl SqliteJobQueue {
    /// Queue living in the same database as `store`.
    pub fn new(store: &SqliteStore) -> Self {
        Self {
            pool: store.pool().clone(),
        }
    }
}

fn expect_one(id: JobId, result: &SqliteQueryResult) -> Result<(), QueueError> {
    if result.rows_affected() == 0 {
        return Err(QueueError::NotFound(id));
    }
    Ok(())
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn push(
        &self,
        job: EncodedJob,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<JobId, QueueError> {
        let id = JobId::new();
        sqlx::query(
            r#"
            INSERT INTO job_queue (id, kind, payload, queue, status, attempts, run_at, enqueued_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&job.kind)
        .bind(&job.payload)
        .bind(options.queue.as_str())
        .bind(to_millis(offset(now, options.delay)))
        .bind(to_millis(now))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;

        Ok(id)
    }

    async fn claim(
        &self,
        queue: QueueClass,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<QueuedJob>, QueueError> {
        // Select and lease in one statement so two workers never share a job.
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE job_queue
            SET status = 'running', attempts = attempts + 1, lease_expires_at = ?, updated_at = ?
            WHERE seq = (
                SELECT seq FROM job_queue
                WHERE queue = ? AND status = 'pending' AND run_at <= ?
                ORDER BY run_at, seq
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(to_millis(offset(now, lease)))
        .bind(to_millis(now))
        .bind(queue.as_str())
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_error)?;

        row.map(job_from_row).transpose()
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM job_queue WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(queue_error)?;
        expect_one(id, &result)
    }

    async fn retry(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE job_queue SET status = 'pending', run_at = ?, last_error = ?, lease_expires_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(to_millis(run_at))
        .bind(error)
        .bind(to_millis(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;
        expect_one(id, &result)
    }

    async fn dead_letter(&self, id: JobId, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE job_queue SET status = 'dead', last_error = ?, lease_expires_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(to_millis(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;
        expect_one(id, &result)
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "UPDATE job_queue SET status = 'pending', lease_expires_at = NULL, updated_at = ? \
             WHERE status = 'running' AND lease_expires_at <= ?",
        )
        .bind(to_millis(now))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;

        Ok(result.rows_affected())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueuedJob>, QueueError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM job_queue WHERE status = 'dead' ORDER BY seq LIMIT ?",
            JOB_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(queue_error)?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn replay(&self, id: JobId, now: DateTime<Utc>) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE job_queue SET status = 'pending', attempts = 0, run_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'dead'",
        )
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;
        expect_one(id, &result)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM job_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(queue_error)?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = usize::try_from(count).unwrap_or(0);
            match JobStatus::parse(&status)? {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Running => stats.running = count,
                JobStatus::Dead => stats.dead = count,
            }
        }
        Ok(stats)
    }
}
