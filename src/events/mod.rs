//! Job lifecycle events and event handling.
//!
//! The worker pool and the sweep scheduler report what they do on an
//! [`EventBus`]; handlers registered on it observe every queued job from
//! claim to acknowledgement or dead-lettering.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::types::JobId;

/// Lifecycle events emitted while jobs are processed.
#[derive(Debug, Clone)]
pub enum Event {
    /// A worker claimed a job and started running it.
    JobStarted {
        job_id: JobId,
        kind: String,
        /// Delivery attempt, 1 for the first.
        attempt: u32,
        timestamp: Instant,
    },

    /// A job ran to completion and was acknowledged.
    JobSucceeded {
        job_id: JobId,
        kind: String,
        duration: Duration,
        timestamp: Instant,
    },

    /// A job failed transiently and was put back with a delay.
    ///
    /// `max_attempts` counts the first delivery, so it is the configured
    /// retry count plus one.
    JobRetrying {
        job_id: JobId,
        kind: String,
        /// The attempt that just failed (1-indexed).
        attempt: u32,
        max_attempts: u32,
        error: String,
        retry_at: DateTime<Utc>,
        timestamp: Instant,
    },

    /// A job failed for good and was moved to the dead-letter set.
    JobDeadLettered {
        job_id: JobId,
        kind: String,
        attempts: u32,
        error: String,
        timestamp: Instant,
    },

    /// The periodic trigger enqueued a sweep.
    SweepEnqueued { job_id: JobId, timestamp: Instant },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::JobStarted { timestamp, .. } => *timestamp,
            Event::JobSucceeded { timestamp, .. } => *timestamp,
            Event::JobRetrying { timestamp, .. } => *timestamp,
            Event::JobDeadLettered { timestamp, .. } => *timestamp,
            Event::SweepEnqueued { timestamp, .. } => *timestamp,
        }
    }

    /// Id of the job the event is about.
    pub fn job_id(&self) -> JobId {
        match self {
            Event::JobStarted { job_id, .. }
            | Event::JobSucceeded { job_id, .. }
            | Event::JobRetrying { job_id, .. }
            | Event::JobDeadLettered { job_id, .. }
            | Event::SweepEnqueued { job_id, .. } => *job_id,
        }
    }

    /// Create a JobStarted event.
    pub fn job_started(job_id: JobId, kind: impl Into<String>, attempt: u32) -> Self {
        Event::JobStarted {
            job_id,
            kind: kind.into(),
            attempt,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobSucceeded event.
    pub fn job_succeeded(job_id: JobId, kind: impl Into<String>, duration: Duration) -> Self {
        Event::JobSucceeded {
            job_id,
            kind: kind.into(),
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobRetrying event.
    pub fn job_retrying(
        job_id: JobId,
        kind: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
        error: impl Into<String>,
        retry_at: DateTime<Utc>,
    ) -> Self {
        Event::JobRetrying {
            job_id,
            kind: kind.into(),
            attempt,
            max_attempts,
            error: error.into(),
            retry_at,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobDeadLettered event.
    pub fn job_dead_lettered(
        job_id: JobId,
        kind: impl Into<String>,
        attempts: u32,
        error: impl Into<String>,
    ) -> Self {
        Event::JobDeadLettered {
            job_id,
            kind: kind.into(),
            attempts,
            error: error.into(),
            timestamp: Instant::now(),
        }
    }

    /// Create a SweepEnqueued event.
    pub fn sweep_enqueued(job_id: JobId) -> Self {
        Event::SweepEnqueued {
            job_id,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
