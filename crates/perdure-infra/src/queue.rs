//! In-process job queue.
//!
//! Implements the `JobQueue` port for embedders and tests that have no
//! host job framework: enqueued jobs are recorded in order and drained by
//! whatever drives execution (a test, or a worker loop polling the queue).
//! Delays are recorded, not slept; dispatch timing belongs to the driver.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use perdure_core::queue::{EnqueueOptions, JobQueue};
use perdure_types::error::QueueError;
use perdure_types::value::JobDescriptor;

/// One recorded enqueue.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job: JobDescriptor,
    pub delay: Option<std::time::Duration>,
    pub enqueued_at: DateTime<Utc>,
}

/// Mutex-guarded FIFO implementing the `JobQueue` port.
#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<Vec<QueuedJob>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every recorded job, oldest first.
    pub fn drain(&self) -> Vec<QueuedJob> {
        match self.jobs.lock() {
            Ok(mut jobs) => jobs.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        job: &JobDescriptor,
        options: EnqueueOptions,
    ) -> Result<(), QueueError> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| QueueError::Dispatch("queue mutex poisoned".to_string()))?;
        jobs.push(QueuedJob {
            job: job.clone(),
            delay: options.delay,
            enqueued_at: Utc::now(),
        });
        tracing::debug!(class = job.class.as_str(), "job enqueued");
        Ok(())
    }
}
