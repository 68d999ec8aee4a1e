//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveTime, Utc};
use rekur::{
    Dispatcher, Event, EventBus, EventHandler, Expander, GenerationHandler, GenerationService,
    GoalId, JobQueue, NewTemplate, RetryPolicy, SqliteJobQueue, SqliteStore, TemplateService,
    UserId, WorkerConfig, WorkerPool,
};
use rekur::worker::WorkerPoolHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const USER: UserId = UserId::new(1);
pub const GOAL: GoalId = GoalId::new(7);

/// Everything a test needs to drive the engine end to end on an
/// in-memory database.
pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub queue: Arc<dyn JobQueue>,
    pub dispatcher: Dispatcher,
    pub templates: TemplateService<SqliteStore>,
    pub generation: Arc<GenerationService<SqliteStore>>,
    pub event_bus: Arc<EventBus>,
    pub events: Arc<RecordingHandler>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_store(SqliteStore::in_memory().await.unwrap()).await
    }

    pub async fn with_store(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(&store));
        let dispatcher = Dispatcher::new(Arc::clone(&queue))
            .with_regenerate_delay(Duration::from_millis(200));
        let templates = TemplateService::new(Arc::clone(&store), dispatcher.clone());
        let generation = Arc::new(GenerationService::new(
            Arc::clone(&store),
            Expander::default(),
        ));

        let event_bus = Arc::new(EventBus::new());
        let events = RecordingHandler::new();
        event_bus.register(events.clone()).await;

        Self {
            store,
            queue,
            dispatcher,
            templates,
            generation,
            event_bus,
            events,
        }
    }

    /// Start a worker pool on this harness' queue.
    pub fn start_pool(&self, config: WorkerConfig) -> WorkerPoolHandle {
        let handler = Arc::new(GenerationHandler::new(Arc::clone(&self.generation)));
        WorkerPool::new(Arc::clone(&self.queue), handler, config)
            .with_event_bus(Arc::clone(&self.event_bus))
            .start()
    }
}

/// Worker settings with short intervals, suitable for tests.
pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        concurrency: 2,
        poll_interval: Duration::from_millis(10),
        lease: Duration::from_secs(30),
        job_timeout: Duration::from_secs(10),
        reap_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(5),
        retry: RetryPolicy::fixed(2, Duration::from_millis(10)),
        ..WorkerConfig::default()
    }
}

/// `days` days from today at 09:00 UTC. Negative values go back.
pub fn at_nine(days: i64) -> DateTime<Utc> {
    let today = Utc::now().date_naive();
    let date = if days >= 0 {
        today + Days::new(days as u64)
    } else {
        today - Days::new(days.unsigned_abs())
    };
    date.and_time(NaiveTime::from_hms_opt(9, 0, 0).unwrap())
        .and_utc()
}

pub fn new_template(title: &str, rule: &str, anchor: DateTime<Utc>) -> NewTemplate {
    NewTemplate {
        user_id: USER,
        goal_id: GOAL,
        title: title.to_string(),
        anchor,
        has_time: true,
        duration_minutes: 30,
        rule: rule.to_string(),
    }
}

/// Wait until the queue has nothing pending or running.
///
/// Polls every 10ms. Dead-lettered jobs do not count as outstanding.
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_idle(queue: &dyn JobQueue, timeout: Duration) {
    let start = tokio::time::Instant::now();
    loop {
        let stats = queue.stats().await.unwrap();
        if stats.pending == 0 && stats.running == 0 {
            return;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for the queue to drain: {} pending, {} running",
                stats.pending, stats.running
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Recording event handler for verifying events.
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    pub async fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().await.iter().filter(|e| predicate(e)).count()
    }

    /// Wait until at least `n` recorded events match `predicate`.
    ///
    /// # Panics
    ///
    /// Panics if the timeout is reached first.
    pub async fn wait_for(
        &self,
        n: usize,
        timeout: Duration,
        predicate: impl Fn(&Event) -> bool,
    ) {
        let start = tokio::time::Instant::now();
        loop {
            let seen = self.count(&predicate).await;
            if seen >= n {
                return;
            }
            if start.elapsed() > timeout {
                panic!("Timeout waiting for {} matching events, saw {}", n, seen);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}
