//! Graceful shutdown integration tests.
//!
//! Tests that verify the worker pool and the sweep scheduler finish the work
//! they already started before exiting.

use async_trait::async_trait;
use rekur::{
    Event, GenerationHandler, JobError, JobHandler, QueuedJob, Schedule, SchedulerError, SqliteStore,
    SweepScheduler, WorkerPool,
};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Harness, USER, at_nine, fast_worker_config, new_template};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Handler that holds every job for a while before running it.
struct SlowHandler {
    inner: GenerationHandler<SqliteStore>,
    delay: Duration,
}

#[async_trait]
impl JobHandler for SlowHandler {
    async fn handle(&self, job: &QueuedJob) -> Result<(), JobError> {
        tokio::time::sleep(self.delay).await;
        self.inner.handle(job).await
    }
}

fn slow_pool(harness: &Harness, delay: Duration, shutdown_timeout: Duration) -> WorkerPool {
    let handler = Arc::new(SlowHandler {
        inner: GenerationHandler::new(Arc::clone(&harness.generation)),
        delay,
    });
    let mut config = fast_worker_config();
    config.shutdown_timeout = shutdown_timeout;
    WorkerPool::new(Arc::clone(&harness.queue), handler, config)
        .with_event_bus(Arc::clone(&harness.event_bus))
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_generation() {
    let harness = Harness::new().await;
    let pool = slow_pool(&harness, Duration::from_millis(300), Duration::from_secs(5)).start();

    let template = harness
        .templates
        .create(new_template("lift", "FREQ=DAILY;COUNT=7", at_nine(1)))
        .await
        .unwrap();
    harness
        .events
        .wait_for(1, TIMEOUT, |e| matches!(e, Event::JobStarted { .. }))
        .await;

    assert!(pool.shutdown().await);

    assert_eq!(
        harness
            .events
            .count(|e| matches!(e, Event::JobSucceeded { .. }))
            .await,
        1
    );
    let tasks = harness.templates.tasks(template.id, USER).await.unwrap();
    assert_eq!(tasks.len(), 7);

    let stats = harness.queue.stats().await.unwrap();
    assert_eq!(stats.pending + stats.running, 0);
}

#[tokio::test]
async fn test_job_cut_off_by_shutdown_stays_leased() {
    let harness = Harness::new().await;
    let pool = slow_pool(&harness, Duration::from_secs(5), Duration::from_millis(100)).start();

    let template = harness
        .templates
        .create(new_template("lift", "FREQ=DAILY;COUNT=7", at_nine(1)))
        .await
        .unwrap();
    harness
        .events
        .wait_for(1, TIMEOUT, |e| matches!(e, Event::JobStarted { .. }))
        .await;

    assert!(!pool.shutdown().await);

    // Nothing was written; the lease hands the job to the next process.
    let tasks = harness.templates.tasks(template.id, USER).await.unwrap();
    assert!(tasks.is_empty());
    let stats = harness.queue.stats().await.unwrap();
    assert_eq!(stats.running, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_scheduler_then_pool_shutdown() {
    let harness = Harness::new().await;

    let scheduler = SweepScheduler::new(Schedule::new("@daily").unwrap(), harness.dispatcher.clone())
        .with_event_bus(Arc::clone(&harness.event_bus));
    let (handle, task) = scheduler.start();
    let pool = harness.start_pool(fast_worker_config());

    assert!(handle.is_running());

    handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert!(!handle.is_running());
    assert!(pool.shutdown().await);

    assert!(matches!(
        handle.trigger().await,
        Err(SchedulerError::ChannelError(_))
    ));
}
