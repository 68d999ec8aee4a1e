//! SQLite storage implementation.
//!
//! Instants are stored as unix milliseconds, calendar dates as ISO text and
//! times of day as microseconds since midnight.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{Executor, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{InsertOutcome, StorageError, Store, TaskRepository, TemplateRepository, Transaction};
use crate::core::task::{NewTaskInstance, TaskInstance, micros_to_time, time_to_micros};
use crate::core::template::{NewTemplate, RecurrenceTemplate, TemplateChanges};
use crate::core::types::{GoalId, TaskInstanceId, TemplateId, UserId};

const DATE_FORMAT: &str = "%Y-%m-%d";

const TEMPLATE_COLUMNS: &str = "id, user_id, goal_id, title, anchor_at, has_time, duration_minutes, rrule, last_generated_at, created_at, updated_at";

const TASK_COLUMNS: &str = "id, user_id, goal_id, template_id, title, scheduled_date, scheduled_time_us, has_time, duration_minutes, is_done, reschedule_count, occurs_at, created_at";

type TemplateRow = (
    i64,
    i64,
    i64,
    String,
    i64,
    bool,
    i32,
    String,
    Option<i64>,
    i64,
    i64,
);

type TaskRow = (
    i64,
    i64,
    i64,
    Option<i64>,
    String,
    String,
    Option<i64>,
    bool,
    i32,
    bool,
    i32,
    Option<i64>,
    i64,
);

/// SQLite-backed store.
///
/// Owns the connection pool shared by template CRUD, generation
/// transactions and the persistent job queue.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory database (useful for testing).
    ///
    /// Limited to one connection: every connection to `:memory:` would
    /// otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Mark a task instance completed or not.
    pub async fn set_task_done(&self, id: TaskInstanceId, done: bool) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE tasks SET is_done = ? WHERE id = ?")
            .bind(done)
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("task: {}", id)));
        }
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        StorageError::SerializationError(format!("timestamp out of range: {}", millis))
    })
}

pub(crate) fn db_error(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn template_from_row(row: TemplateRow) -> Result<RecurrenceTemplate, StorageError> {
    Ok(RecurrenceTemplate {
        id: TemplateId::new(row.0),
        user_id: UserId::new(row.1),
        goal_id: GoalId::new(row.2),
        title: row.3,
        anchor: from_millis(row.4)?,
        has_time: row.5,
        duration_minutes: row.6,
        rule: row.7,
        last_generated_at: row.8.map(from_millis).transpose()?,
        created_at: from_millis(row.9)?,
        updated_at: from_millis(row.10)?,
    })
}

fn task_from_row(row: TaskRow) -> Result<TaskInstance, StorageError> {
    let scheduled_date = NaiveDate::parse_from_str(&row.5, DATE_FORMAT)
        .map_err(|e| StorageError::SerializationError(format!("scheduled_date: {}", e)))?;
    let scheduled_time = match row.6 {
        Some(micros) => Some(micros_to_time(micros).ok_or_else(|| {
            StorageError::SerializationError(format!("scheduled_time out of range: {}", micros))
        })?),
        None => None,
    };

    Ok(TaskInstance {
        id: TaskInstanceId::new(row.0),
        user_id: UserId::new(row.1),
        goal_id: GoalId::new(row.2),
        template_id: row.3.map(TemplateId::new),
        title: row.4,
        scheduled_date,
        scheduled_time,
        has_time: row.7,
        duration_minutes: row.8,
        is_done: row.9,
        reschedule_count: row.10,
        occurs_at: row.11.map(from_millis).transpose()?,
        created_at: from_millis(row.12)?,
    })
}

async fn fetch_template<'e, E>(executor: E, id: TemplateId) -> Result<RecurrenceTemplate, StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: TemplateRow = sqlx::query_as(&format!(
        "SELECT {} FROM recurrence_templates WHERE id = ?",
        TEMPLATE_COLUMNS
    ))
    .bind(id.get())
    .fetch_optional(executor)
    .await
    .map_err(db_error)?
    .ok_or_else(|| StorageError::NotFound(format!("template: {}", id)))?;

    template_from_row(row)
}

/// A transaction on a [`SqliteStore`].
pub struct SqliteTx {
    tx: sqlx::Transaction<'static, Sqlite>,
}

#[async_trait]
impl TemplateRepository for SqliteTx {
    async fn get(&mut self, id: TemplateId) -> Result<RecurrenceTemplate, StorageError> {
        fetch_template(&mut *self.tx, id).await
    }

    async fn list_due(
        &mut self,
        horizon_end: DateTime<Utc>,
    ) -> Result<Vec<RecurrenceTemplate>, StorageError> {
        let rows: Vec<TemplateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM recurrence_templates \
             WHERE last_generated_at IS NULL OR last_generated_at < ? ORDER BY id",
            TEMPLATE_COLUMNS
        ))
        .bind(to_millis(horizon_end))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(template_from_row).collect()
    }

    async fn update_watermark(
        &mut self,
        id: TemplateId,
        watermark: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let millis = to_millis(watermark);
        let result = sqlx::query(
            "UPDATE recurrence_templates \
             SET last_generated_at = MAX(COALESCE(last_generated_at, ?), ?) WHERE id = ?",
        )
        .bind(millis)
        .bind(millis)
        .bind(id.get())
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("template: {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for SqliteTx {
    async fn insert(&mut self, task: &NewTaskInstance) -> Result<InsertOutcome, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (user_id, goal_id, template_id, title, scheduled_date, scheduled_time_us,
                               has_time, duration_minutes, is_done, reschedule_count, occurs_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (template_id, occurs_at) DO NOTHING
            "#,
        )
        .bind(task.user_id.get())
        .bind(task.goal_id.get())
        .bind(task.template_id.map(TemplateId::get))
        .bind(&task.title)
        .bind(task.scheduled_date.format(DATE_FORMAT).to_string())
        .bind(task.scheduled_time.map(time_to_micros))
        .bind(task.has_time)
        .bind(task.duration_minutes)
        .bind(task.is_done)
        .bind(task.reschedule_count)
        .bind(task.occurs_at.map(to_millis))
        .bind(to_millis(Utc::now()))
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        Ok(InsertOutcome::Inserted(TaskInstanceId::new(
            result.last_insert_rowid(),
        )))
    }

    async fn delete_future_by_template_id(
        &mut self,
        template_id: TemplateId,
        now: DateTime<Utc>,
        created_before: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError> {
        let created_before = created_before.map(to_millis);
        let result = sqlx::query(
            "DELETE FROM tasks WHERE template_id = ? AND is_done = 0 AND occurs_at >= ? \
             AND (? IS NULL OR created_at < ?)",
        )
        .bind(template_id.get())
        .bind(to_millis(now))
        .bind(created_before)
        .bind(created_before)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Transaction for SqliteTx {
    async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await.map_err(db_error)
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback().await.map_err(db_error)
    }
}

#[async_trait]
impl Store for SqliteStore {
    type Tx = SqliteTx;

    async fn begin(&self) -> Result<SqliteTx, StorageError> {
        // Take the write lock up front. A deferred transaction that reads
        // first fails with SQLITE_BUSY on upgrade instead of waiting out the
        // busy timeout.
        let tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(db_error)?;
        Ok(SqliteTx { tx })
    }

    async fn create_template(
        &self,
        template: NewTemplate,
    ) -> Result<RecurrenceTemplate, StorageError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO recurrence_templates
                (user_id, goal_id, title, anchor_at, has_time, duration_minutes, rrule, last_generated_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(template.user_id.get())
        .bind(template.goal_id.get())
        .bind(&template.title)
        .bind(to_millis(template.anchor))
        .bind(template.has_time)
        .bind(template.duration_minutes)
        .bind(&template.rule)
        .bind(to_millis(now))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        fetch_template(&self.pool, TemplateId::new(result.last_insert_rowid())).await
    }

    async fn update_template(
        &self,
        id: TemplateId,
        user_id: UserId,
        changes: TemplateChanges,
    ) -> Result<RecurrenceTemplate, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE recurrence_templates
            SET goal_id = ?, title = ?, anchor_at = ?, has_time = ?, duration_minutes = ?, rrule = ?, updated_at = ?
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(changes.goal_id.get())
        .bind(&changes.title)
        .bind(to_millis(changes.anchor))
        .bind(changes.has_time)
        .bind(changes.duration_minutes)
        .bind(&changes.rule)
        .bind(to_millis(Utc::now()))
        .bind(id.get())
        .bind(user_id.get())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("template: {}", id)));
        }
        fetch_template(&self.pool, id).await
    }

    async fn delete_template(&self, id: TemplateId, user_id: UserId) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM recurrence_templates WHERE id = ? AND user_id = ?")
            .bind(id.get())
            .bind(user_id.get())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("template: {}", id)));
        }
        Ok(())
    }

    async fn find_template(&self, id: TemplateId) -> Result<RecurrenceTemplate, StorageError> {
        fetch_template(&self.pool, id).await
    }

    async fn list_templates(
        &self,
        user_id: UserId,
    ) -> Result<Vec<RecurrenceTemplate>, StorageError> {
        let rows: Vec<TemplateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM recurrence_templates WHERE user_id = ? ORDER BY id",
            TEMPLATE_COLUMNS
        ))
        .bind(user_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(template_from_row).collect()
    }

    async fn list_tasks_for_template(
        &self,
        template_id: TemplateId,
    ) -> Result<Vec<TaskInstance>, StorageError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tasks WHERE template_id = ? ORDER BY occurs_at, id",
            TASK_COLUMNS
        ))
        .bind(template_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(task_from_row).collect()
    }
}
