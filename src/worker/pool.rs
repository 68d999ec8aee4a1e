//! Fixed-size worker pool over the weighted job queues.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{JobError, JobHandler};
use crate::core::retry::RetryPolicy;
use crate::events::{Event, EventBus};
use crate::jobs::QueueClass;
use crate::jobs::queue::{JobQueue, QueuedJob, offset};

/// Relative share of claims each queue class receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueWeights {
    pub critical: u32,
    pub default: u32,
    pub low: u32,
}

impl Default for QueueWeights {
    fn default() -> Self {
        Self {
            critical: 6,
            default: 3,
            low: 1,
        }
    }
}

impl QueueWeights {
    pub fn weight(&self, queue: QueueClass) -> u32 {
        match queue {
            QueueClass::Critical => self.critical,
            QueueClass::Default => self.default,
            QueueClass::Low => self.low,
        }
    }

    /// Sum of all weights, exact for any `u32` values.
    pub fn total(&self) -> u64 {
        u64::from(self.critical) + u64::from(self.default) + u64::from(self.low)
    }

    /// Order in which a worker polls the queues for its next claim.
    ///
    /// Queues are drawn without replacement, each with probability
    /// proportional to its weight. Zero-weight queues are never polled.
    pub fn poll_order<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<QueueClass> {
        let mut remaining: Vec<QueueClass> = QueueClass::ALL
            .into_iter()
            .filter(|q| self.weight(*q) > 0)
            .collect();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let total: u64 = remaining.iter().map(|q| u64::from(self.weight(*q))).sum();
            let mut pick = rng.gen_range(0..total);
            let index = remaining
                .iter()
                .position(|q| {
                    let weight = u64::from(self.weight(*q));
                    if pick < weight {
                        true
                    } else {
                        pick -= weight;
                        false
                    }
                })
                .unwrap_or(0);
            order.push(remaining.remove(index));
        }
        order
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,
    pub weights: QueueWeights,
    /// Sleep between polls when every queue is empty.
    pub poll_interval: Duration,
    /// How long a claim stays leased to its worker.
    pub lease: Duration,
    /// Per-job time limit. Kept below `lease` so a slow job does not get
    /// redelivered while still running.
    pub job_timeout: Duration,
    /// How often expired leases are returned to the queue.
    pub reap_interval: Duration,
    /// Grace period for in-flight jobs on shutdown.
    pub shutdown_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            weights: QueueWeights::default(),
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(60),
            job_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// State shared by every worker of a pool.
struct Shared {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    event_bus: Arc<EventBus>,
}

/// Pool of workers consuming generation jobs.
pub struct WorkerPool {
    shared: Shared,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            shared: Shared {
                queue,
                handler,
                config,
                event_bus: Arc::new(EventBus::new()),
            },
        }
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.shared.event_bus = event_bus;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    /// Spawn the workers and the lease reaper.
    pub fn start(self) -> WorkerPoolHandle {
        let shared = Arc::new(self.shared);
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for worker in 0..shared.config.concurrency {
            tasks.spawn(run_worker(worker, Arc::clone(&shared), cancel.clone()));
        }
        tasks.spawn(run_reaper(Arc::clone(&shared), cancel.clone()));

        tracing::info!(
            concurrency = shared.config.concurrency,
            "Worker pool started"
        );

        WorkerPoolHandle {
            cancel,
            tasks,
            shutdown_timeout: shared.config.shutdown_timeout,
        }
    }
}

/// Handle owning the running workers.
pub struct WorkerPoolHandle {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    shutdown_timeout: Duration,
}

impl WorkerPoolHandle {
    /// Token cancelled when the pool begins shutting down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop claiming and wait for in-flight jobs.
    ///
    /// Jobs still running after the grace period are aborted. Their leases
    /// are left to expire, so they are delivered again after a restart.
    /// Returns `true` when every worker finished within the grace period.
    pub async fn shutdown(mut self) -> bool {
        self.cancel.cancel();

        let tasks = &mut self.tasks;
        let drain = async move {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Worker ended abnormally");
                }
            }
        };
        let drained = tokio::time::timeout(self.shutdown_timeout, drain).await;

        match drained {
            Ok(()) => {
                tracing::info!("Worker pool stopped gracefully");
                true
            }
            Err(_) => {
                tracing::warn!(
                    "Graceful shutdown timeout ({:?}) exceeded with {} worker(s) busy, aborting",
                    self.shutdown_timeout,
                    self.tasks.len()
                );
                self.tasks.abort_all();
                while self.tasks.join_next().await.is_some() {}
                false
            }
        }
    }
}

async fn run_worker(worker: usize, shared: Arc<Shared>, cancel: CancellationToken) {
    tracing::debug!(worker, "Worker started");

    while !cancel.is_cancelled() {
        let order = shared.config.weights.poll_order(&mut rand::thread_rng());

        match claim_next(&shared, &order).await {
            Ok(Some(job)) => process(&shared, job).await,
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.poll_interval) => {}
                }
            }
            Err(e) => {
                tracing::warn!(worker, error = %e, "Failed to claim job");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.poll_interval) => {}
                }
            }
        }
    }

    tracing::debug!(worker, "Worker stopped");
}

async fn claim_next(
    shared: &Shared,
    order: &[QueueClass],
) -> Result<Option<QueuedJob>, crate::jobs::QueueError> {
    for &queue in order {
        if let Some(job) = shared
            .queue
            .claim(queue, Utc::now(), shared.config.lease)
            .await?
        {
            return Ok(Some(job));
        }
    }
    Ok(None)
}

async fn process(shared: &Shared, job: QueuedJob) {
    let start = Instant::now();
    shared
        .event_bus
        .emit(Event::job_started(job.id, job.kind.clone(), job.attempts))
        .await;
    tracing::debug!(job_id = %job.id, job_type = %job.kind, attempt = job.attempts, "Running job");

    let timeout = shared.config.job_timeout;
    let result = match tokio::time::timeout(timeout, shared.handler.handle(&job)).await {
        Ok(result) => result,
        Err(_) => Err(JobError::Timeout(timeout)),
    };

    match result {
        Ok(()) => {
            if let Err(e) = shared.queue.complete(job.id).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to acknowledge job");
                return;
            }
            shared
                .event_bus
                .emit(Event::job_succeeded(job.id, job.kind.clone(), start.elapsed()))
                .await;
        }
        Err(e) => fail(shared, &job, e).await,
    }
}

async fn fail(shared: &Shared, job: &QueuedJob, error: JobError) {
    let retry = &shared.config.retry;
    let message = error.to_string();
    let template_id = job.decode().ok().and_then(|j| j.template_id());

    if retry.should_retry(job.attempts, error.is_transient()) {
        let run_at = offset(Utc::now(), retry.delay_for(job.attempts));
        tracing::warn!(
            job_id = %job.id,
            job_type = %job.kind,
            template_id = ?template_id,
            attempt = job.attempts,
            retry_at = %run_at,
            error = %message,
            "Job failed, retrying"
        );
        if let Err(e) = shared.queue.retry(job.id, run_at, &message).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to reschedule job");
            return;
        }
        shared
            .event_bus
            .emit(Event::job_retrying(
                job.id,
                job.kind.clone(),
                job.attempts,
                retry.max_retries.saturating_add(1),
                message,
                run_at,
            ))
            .await;
    } else {
        tracing::error!(
            job_id = %job.id,
            job_type = %job.kind,
            template_id = ?template_id,
            attempts = job.attempts,
            error = %message,
            "Job failed permanently, moving to dead letters"
        );
        if let Err(e) = shared.queue.dead_letter(job.id, &message).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to dead-letter job");
            return;
        }
        shared
            .event_bus
            .emit(Event::job_dead_lettered(
                job.id,
                job.kind.clone(),
                job.attempts,
                message,
            ))
            .await;
    }
}

async fn run_reaper(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(shared.config.reap_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match shared.queue.requeue_expired(Utc::now()).await {
                    Ok(0) => {}
                    Ok(requeued) => {
                        tracing::warn!(requeued, "Returned expired leases to the queue");
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to requeue expired leases"),
                }
            }
        }
    }
}
