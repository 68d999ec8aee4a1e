//! Sweep scheduler implementation.
//!
//! The scheduler owns a single periodic trigger. On every occurrence of its
//! schedule it asks the dispatcher to enqueue a sweep job and does nothing
//! else; the sweep itself runs on the worker pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::types::{SchedulerCommand, SchedulerError};
use crate::core::schedule::Schedule;
use crate::core::types::JobId;
use crate::events::{Event, EventBus};
use crate::jobs::Dispatcher;

/// Upper bound on missed occurrences counted per tick.
const MAX_COUNT_ITERATIONS: usize = 100;

/// Default interval between schedule checks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Default bound on waiting for an in-flight trigger at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Periodic trigger enqueuing sweep jobs.
pub struct SweepScheduler {
    schedule: Schedule,
    dispatcher: Dispatcher,
    event_bus: Arc<EventBus>,
    tick_interval: Duration,
    shutdown_timeout: Duration,
    /// Trigger spawned by the last due occurrence, if any.
    in_flight: Option<JoinHandle<()>>,
}

impl SweepScheduler {
    /// Create a scheduler firing on `schedule`.
    pub fn new(schedule: Schedule, dispatcher: Dispatcher) -> Self {
        Self {
            schedule,
            dispatcher,
            event_bus: Arc::new(EventBus::new()),
            tick_interval: DEFAULT_TICK_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            in_flight: None,
        }
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set how long shutdown waits for an in-flight trigger.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Start the scheduler and return a handle for controlling it.
    pub fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let running = Arc::new(AtomicBool::new(true));

        let handle = SchedulerHandle {
            commands,
            running: Arc::clone(&running),
        };

        tracing::info!(
            schedule = %self.schedule.expression(),
            timezone = %self.schedule.timezone(),
            "Sweep scheduler started"
        );
        let scheduler_task = tokio::spawn(async move {
            self.run(command_rx).await;
            running.store(false, Ordering::Release);
        });

        (handle, scheduler_task)
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<SchedulerCommand>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        let mut last_check = chrono::Utc::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = chrono::Utc::now();
                    self.check_schedule(last_check, now);
                    last_check = now;
                }

                command = command_rx.recv() => {
                    // Every handle dropped: nothing can stop us later, so stop now.
                    let Some(command) = command else {
                        self.await_in_flight().await;
                        break;
                    };

                    match command {
                        SchedulerCommand::Trigger { reply } => {
                            let result = self.trigger_now().await;
                            let _ = reply.send(result);
                        }
                        SchedulerCommand::Shutdown { reply } => {
                            self.await_in_flight().await;
                            let _ = reply.send(());
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Sweep scheduler stopped");
    }

    /// Fire once if the schedule had any occurrence in `(last_check, now]`.
    ///
    /// Several missed occurrences (slow tick, clock jump) still fire a single
    /// sweep; the sweep covers everything that is due anyway.
    fn check_schedule(
        &mut self,
        last_check: chrono::DateTime<chrono::Utc>,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let occurrence_count =
            self.schedule
                .occurrences_between(last_check, now, MAX_COUNT_ITERATIONS);

        if occurrence_count == 0 {
            return;
        }

        if occurrence_count >= MAX_COUNT_ITERATIONS {
            tracing::warn!(
                last_check = %last_check,
                now = %now,
                missed_occurrences = format!("{}+", occurrence_count),
                "Many sweep occurrences missed ({}+), triggering once",
                MAX_COUNT_ITERATIONS
            );
        } else if occurrence_count > 1 {
            tracing::warn!(
                last_check = %last_check,
                now = %now,
                missed_occurrences = occurrence_count,
                "Multiple sweep occurrences missed, triggering once"
            );
        }

        if self.in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::warn!("Previous sweep trigger still running, skipping this occurrence");
            return;
        }

        let dispatcher = self.dispatcher.clone();
        let event_bus = Arc::clone(&self.event_bus);
        self.in_flight = Some(tokio::spawn(async move {
            if let Some(job_id) = dispatcher.daily_sweep().await {
                event_bus.emit(Event::sweep_enqueued(job_id)).await;
            }
        }));
    }

    /// Manual trigger: enqueue a sweep and surface failures.
    async fn trigger_now(&self) -> Result<JobId, SchedulerError> {
        let job_id = self.dispatcher.enqueue_sweep().await?;
        tracing::info!(job_id = %job_id, "Sweep triggered manually");
        self.event_bus.emit(Event::sweep_enqueued(job_id)).await;
        Ok(job_id)
    }

    /// Wait for the in-flight trigger, bounded by the shutdown timeout.
    async fn await_in_flight(&mut self) {
        let Some(handle) = self.in_flight.take() else {
            return;
        };
        if handle.is_finished() {
            return;
        }

        tracing::info!(
            "Graceful shutdown: waiting for in-flight sweep trigger (timeout: {:?})",
            self.shutdown_timeout
        );
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.shutdown_timeout, handle).await {
            Ok(Ok(())) => tracing::info!("In-flight sweep trigger completed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "In-flight sweep trigger failed"),
            Err(_) => {
                tracing::warn!(
                    "Graceful shutdown timeout ({:?}) exceeded, aborting sweep trigger",
                    self.shutdown_timeout
                );
                abort.abort();
            }
        }
    }
}
