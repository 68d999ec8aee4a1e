pub mod config;
pub mod core;
pub mod events;
pub mod generation;
pub mod jobs;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod worker;

pub use config::{AppConfig, ConfigError, ConfigLoader};
pub use core::recurrence::{Expander, Recurrence, RecurrenceError, preview};
pub use core::retry::{RetryCondition, RetryPolicy};
pub use core::schedule::{Schedule, ScheduleError};
pub use core::task::{NewTaskInstance, TaskInstance};
pub use core::template::{NewTemplate, RecurrenceTemplate, TemplateChanges};
pub use core::types::{GoalId, JobId, TaskInstanceId, TemplateId, UserId};
pub use events::{Event, EventBus, EventHandler};
pub use generation::{
    GenerationError, GenerationOutcome, GenerationService, MaterializeOutcome, Materializer,
    SweepReport,
};
pub use jobs::{
    Dispatcher, EnqueueError, EnqueueOptions, GenerationJob, InMemoryJobQueue, JobQueue,
    QueueClass, QueuedJob, SqliteJobQueue,
};
pub use scheduler::{SchedulerError, SchedulerHandle, SweepScheduler};
pub use service::{TemplateError, TemplateService};
pub use storage::{SqliteStore, StorageError, Store, Transaction};
pub use worker::{GenerationHandler, JobError, JobHandler, WorkerConfig, WorkerPool};
