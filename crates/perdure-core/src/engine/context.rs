//! Per-step execution context.
//!
//! [`StepContext`] is what a step body sees: the persisted context store
//! (fetch-if-absent and buffered puts), fan-out, audit recording, and
//! access to the host queue for self-scheduled resumption. It holds a
//! narrow, dyn-compatible slice of the engine's persistence surface so the
//! action trait stays free of repository generics.

use std::pin::Pin;

use chrono::Utc;
use perdure_types::error::{QueueError, RepositoryError};
use perdure_types::execution::{BatchedJob, ContextValue, Entry, EntryAction, RecoveryPoint};
use perdure_types::value::{JobDescriptor, WorkflowValue};
use uuid::Uuid;

use crate::queue::EnqueueOptions;
use crate::serializer::SerializerRegistry;

use super::step::StepError;

// ---------------------------------------------------------------------------
// ContextOps
// ---------------------------------------------------------------------------

/// The persistence/queue surface a step body may touch, object-safe so the
/// context can hold it without repository generics.
pub(crate) trait ContextOps: Send + Sync {
    fn fetch_value<'a>(
        &'a self,
        execution_id: Uuid,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, RepositoryError>> + Send + 'a>>;

    fn store_value_if_absent<'a>(
        &'a self,
        execution_id: Uuid,
        key: &'a str,
        value: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, RepositoryError>> + Send + 'a>>;

    fn append_entry<'a>(
        &'a self,
        entry: &'a Entry,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>>;

    fn insert_batched_jobs<'a>(
        &'a self,
        jobs: &'a [BatchedJob],
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>>;

    fn delete_unperformed_batched_jobs<'a>(
        &'a self,
        execution_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<u64, RepositoryError>> + Send + 'a>>;

    fn enqueue<'a>(
        &'a self,
        job: &'a JobDescriptor,
        options: EnqueueOptions,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>>;
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Execution context handed to a step body for one atomic phase.
pub struct StepContext<'a> {
    ops: &'a dyn ContextOps,
    registry: &'a SerializerRegistry,
    execution_id: Uuid,
    step: String,
    cursor: u32,
    /// Where the parent advances once a fanned-out cohort completes.
    progress_to: RecoveryPoint,
    /// Buffered `put` writes, flushed at the phase boundary.
    pending: Vec<(String, String)>,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        ops: &'a dyn ContextOps,
        registry: &'a SerializerRegistry,
        execution_id: Uuid,
        step: String,
        cursor: u32,
        progress_to: RecoveryPoint,
    ) -> Self {
        Self {
            ops,
            registry,
            execution_id,
            step,
            cursor,
            progress_to,
            pending: Vec::new(),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    /// Iteration offset within this step: 0 on first entry, advanced by
    /// each repeat.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Drain the buffered puts into rows for the phase commit.
    pub(crate) fn take_pending(&mut self) -> Vec<ContextValue> {
        self.pending
            .drain(..)
            .map(|(key, value)| ContextValue::new(self.execution_id, key, value))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Context store
    // -----------------------------------------------------------------------

    /// Fetch-if-absent: return the stored value for `key`, or compute,
    /// persist, and return it. The compute closure runs at most once
    /// across all attempts of this run: the primitive that makes
    /// non-idempotent side effects retry-safe.
    pub async fn fetch<F, Fut>(&mut self, key: &str, compute: F) -> Result<WorkflowValue, StepError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<WorkflowValue, StepError>> + Send,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }
        let computed = compute().await?;
        let encoded = self.registry.dump(&computed)?;
        // Racing writers resolve to one stored value; everyone observes
        // the winner.
        let winner = self
            .ops
            .store_value_if_absent(self.execution_id, key, &encoded)
            .await?;
        Ok(self.registry.load(&winner)?)
    }

    /// Read a context value without computing. Buffered puts from this
    /// phase shadow the stored row.
    pub async fn get(&self, key: &str) -> Result<Option<WorkflowValue>, StepError> {
        if let Some((_, encoded)) = self.pending.iter().rev().find(|(k, _)| k == key) {
            return Ok(Some(self.registry.load(encoded)?));
        }
        match self.ops.fetch_value(self.execution_id, key).await? {
            Some(encoded) => Ok(Some(self.registry.load(&encoded)?)),
            None => Ok(None),
        }
    }

    /// Buffer an upsert, flushed at the phase boundary (inside the phase
    /// transaction when the step is transactional). Use for values that
    /// legitimately change across iterations, like paging cursors.
    pub fn put(&mut self, key: impl Into<String>, value: WorkflowValue) -> Result<(), StepError> {
        let encoded = self.registry.dump(&value)?;
        self.pending.push((key.into(), encoded));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    /// Enqueue a cohort of child jobs whose collective completion resumes
    /// this run at the current step's transition target.
    ///
    /// Idempotent across attempts through a context-store guard: once a
    /// cohort is recorded for this step, later attempts are no-ops.
    /// Children are enqueued before the guard commits; a crash inside this
    /// call re-dispatches children (safe under child admission) instead of
    /// stranding the cohort.
    pub async fn fan_out(&mut self, jobs: Vec<JobDescriptor>) -> Result<(), StepError> {
        let guard_key = format!("fanout:{}", self.step);
        if self
            .ops
            .fetch_value(self.execution_id, &guard_key)
            .await?
            .is_some()
        {
            tracing::debug!(
                execution_id = %self.execution_id,
                step = self.step.as_str(),
                "fan-out cohort already recorded"
            );
            return Ok(());
        }

        // Rows from a crashed earlier attempt were never guarded and their
        // children never dispatched; clear them so the cohort count is
        // exact.
        self.ops
            .delete_unperformed_batched_jobs(self.execution_id)
            .await?;

        let stamped: Vec<JobDescriptor> = jobs
            .into_iter()
            .map(|job| job.with_job_id(Uuid::now_v7()))
            .collect();

        let now = Utc::now();
        let mut rows = Vec::with_capacity(stamped.len());
        for job in &stamped {
            let job_id = job.job_id.ok_or_else(|| {
                StepError::failed("fan-out descriptor missing its stamped job id")
            })?;
            rows.push(BatchedJob {
                execution_id: self.execution_id,
                job_id,
                serialized_job: self.registry.dump(&WorkflowValue::Job(job.clone()))?,
                progress_to: self.progress_to.clone(),
                performed_at: None,
                created_at: now,
            });
        }
        self.ops.insert_batched_jobs(&rows).await?;

        for job in &stamped {
            self.ops.enqueue(job, EnqueueOptions::default()).await?;
        }

        let cohort = WorkflowValue::List(
            rows.iter()
                .map(|row| WorkflowValue::Text(row.job_id.to_string()))
                .collect(),
        );
        self.ops
            .store_value_if_absent(self.execution_id, &guard_key, &self.registry.dump(&cohort)?)
            .await?;

        tracing::debug!(
            execution_id = %self.execution_id,
            step = self.step.as_str(),
            children = rows.len(),
            "fan-out cohort dispatched"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Audit + scheduling
    // -----------------------------------------------------------------------

    /// Append a custom audit entry for this step (`iterated`,
    /// `compensated`, `skipped`, ...). Immediate and append-only.
    pub async fn record(
        &self,
        action: EntryAction,
        data: serde_json::Value,
    ) -> Result<(), StepError> {
        let entry = Entry::new(self.execution_id, self.step.clone(), action, data);
        self.ops.append_entry(&entry).await?;
        Ok(())
    }

    /// Schedule a job on the host queue, typically this run's own
    /// descriptor with a delay, so a halting step arranges its resumption.
    pub async fn enqueue(
        &self,
        job: &JobDescriptor,
        options: EnqueueOptions,
    ) -> Result<(), StepError> {
        self.ops.enqueue(job, options).await?;
        Ok(())
    }
}
