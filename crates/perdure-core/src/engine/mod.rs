//! The workflow engine: admission, locking, and the atomic-phase run loop.
//!
//! One invocation maps to one job attempt. The engine admits the run under
//! its idempotency key, takes the cooperative lock, then repeatedly
//! resolves the recovery pointer to a step, executes it as one atomic
//! phase, and advances or halts. Crashed attempts leave a lock that
//! self-heals after the timeout; failed attempts release it eagerly so the
//! host framework's retry lands immediately.
//!
//! # Phase protocol
//!
//! 1. Append `started`, committed before the body runs, so resumption
//!    always knows an attempt was made.
//! 2. Invoke the step body.
//! 3. `Continue`/`Finish`: commit pointer advance + buffered context
//!    writes + `succeeded` in one store transaction (per-step
//!    configurable).
//! 4. `Halt`: flush writes, append `halted`, release the lock, return
//!    cleanly with the pointer resting on this step.
//! 5. `Repeat`: flush writes, no transition entry, re-enter in-process
//!    with the cursor advanced.
//! 6. Error: append `errored` durably, release the lock, surface the
//!    failure to the host for its retry policy.

use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use perdure_types::definition::{DefinitionError, TransactionScope};
use perdure_types::error::{CodecError, QueueError, RepositoryError};
use perdure_types::execution::{
    BatchedJob, Entry, EntryAction, Execution, RecoveryPoint,
};
use perdure_types::value::{JobDescriptor, WorkflowValue};
use serde_json::json;
use uuid::Uuid;

use crate::queue::{EnqueueOptions, JobQueue};
use crate::repository::ExecutionRepository;
use crate::serializer::SerializerRegistry;

pub mod context;
pub mod step;

pub use context::StepContext;
pub use step::{StepAction, StepError, StepVerdict, Workflow};

use context::ContextOps;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default cooperative lock timeout (90 seconds). An abandoned lock
/// self-heals after this window, trading strict mutual exclusion for
/// availability.
pub const DEFAULT_LOCK_TIMEOUT_SECS: i64 = 90;

/// Default cap on step phases within a single invocation, guarding
/// against a definition that loops forever in-process.
pub const DEFAULT_PHASE_BUDGET: u32 = 100;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors surfaced by the engine.
///
/// Only `StepFailed` is expected to be retried, and only by the host
/// framework re-invoking the run; everything else is a programmer or
/// configuration error surfaced without retry.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The same idempotency key arrived with different job arguments.
    #[error("idempotency key '{key}' reused with different job arguments")]
    IdentityMismatch { key: String },

    /// Another attempt holds the run within the lock timeout window.
    #[error("execution '{key}' is locked by another attempt (since {locked_at})")]
    LockHeld {
        key: String,
        locked_at: DateTime<Utc>,
    },

    /// The persisted pointer names a step the current definition lacks:
    /// the definition changed incompatibly under in-flight runs.
    #[error("recovery point '{point}' does not resolve to a step in the current definition")]
    UnknownRecoveryPoint { point: String },

    /// A step body failed; recorded durably, lock released, host retries.
    #[error("step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    /// A single invocation exceeded its phase budget.
    #[error("phase budget of {budget} exhausted in a single invocation")]
    PhaseBudgetExhausted { budget: u32 },

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// How a run invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The pointer reached the finished sentinel (now or previously).
    Finished,
    /// The run paused at a step, awaiting external resumption.
    Halted { step: String },
}

/// Result of recording one child-job completion against the join barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The row was already performed (or unknown): a duplicate report.
    AlreadyRecorded,
    /// Cohort still has unperformed rows.
    Pending { outstanding: u64 },
    /// This report completed the cohort and resumed the parent.
    Resumed { progress_to: RecoveryPoint },
    /// The cohort completed but a racing sibling already resumed the
    /// parent.
    AlreadyResumed,
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

enum Admission {
    Admitted(Execution),
    AlreadyFinished,
}

// ---------------------------------------------------------------------------
// EngineOps: the narrow surface handed to step bodies
// ---------------------------------------------------------------------------

struct EngineOps<'e, R: ExecutionRepository, Q: JobQueue> {
    repository: &'e R,
    queue: &'e Q,
}

impl<R: ExecutionRepository, Q: JobQueue> ContextOps for EngineOps<'_, R, Q> {
    fn fetch_value<'a>(
        &'a self,
        execution_id: Uuid,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, RepositoryError>> + Send + 'a>> {
        Box::pin(self.repository.fetch_value(execution_id, key))
    }

    fn store_value_if_absent<'a>(
        &'a self,
        execution_id: Uuid,
        key: &'a str,
        value: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, RepositoryError>> + Send + 'a>> {
        Box::pin(self.repository.store_value_if_absent(execution_id, key, value))
    }

    fn append_entry<'a>(
        &'a self,
        entry: &'a Entry,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>> {
        Box::pin(self.repository.append_entry(entry))
    }

    fn insert_batched_jobs<'a>(
        &'a self,
        jobs: &'a [BatchedJob],
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>> {
        Box::pin(self.repository.insert_batched_jobs(jobs))
    }

    fn delete_unperformed_batched_jobs<'a>(
        &'a self,
        execution_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<u64, RepositoryError>> + Send + 'a>> {
        Box::pin(self.repository.delete_unperformed_batched_jobs(execution_id))
    }

    fn enqueue<'a>(
        &'a self,
        job: &'a JobDescriptor,
        options: EnqueueOptions,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>> {
        Box::pin(self.queue.enqueue(job, options))
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// The run loop. Generic over the storage and queue ports; single-threaded
/// per invocation; concurrency exists only between independent
/// invocations, mediated by the admission protocol and the join barrier.
pub struct WorkflowEngine<R: ExecutionRepository, Q: JobQueue> {
    repository: Arc<R>,
    queue: Arc<Q>,
    registry: Arc<SerializerRegistry>,
    lock_timeout: Duration,
    phase_budget: u32,
}

impl<R: ExecutionRepository, Q: JobQueue> WorkflowEngine<R, Q> {
    pub fn new(repository: Arc<R>, queue: Arc<Q>, registry: Arc<SerializerRegistry>) -> Self {
        Self {
            repository,
            queue,
            registry,
            lock_timeout: Duration::seconds(DEFAULT_LOCK_TIMEOUT_SECS),
            phase_budget: DEFAULT_PHASE_BUDGET,
        }
    }

    pub fn with_lock_timeout_secs(mut self, secs: i64) -> Self {
        self.lock_timeout = Duration::seconds(secs);
        self
    }

    pub fn with_phase_budget(mut self, budget: u32) -> Self {
        self.phase_budget = budget;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Execute one attempt of the workflow identified by `key`.
    ///
    /// Admits (or resumes) the execution, then drives the run loop until
    /// the pointer finishes, a step halts, or a step fails.
    pub async fn run(
        &self,
        key: &str,
        job: &JobDescriptor,
        workflow: &Workflow,
    ) -> Result<RunOutcome, EngineError> {
        workflow.definition.validate()?;
        let serialized_job = self.registry.dump(&WorkflowValue::Job(job.clone()))?;

        let mut execution = match self.admit(key, &serialized_job, workflow).await? {
            Admission::AlreadyFinished => return Ok(RunOutcome::Finished),
            Admission::Admitted(execution) => execution,
        };

        self.seed_defaults(&execution).await?;
        self.run_loop(&mut execution, workflow).await
    }

    async fn admit(
        &self,
        key: &str,
        serialized_job: &str,
        workflow: &Workflow,
    ) -> Result<Admission, EngineError> {
        let now = Utc::now();

        if let Some(found) = self.repository.find_by_key(key).await? {
            return self.admit_existing(found, key, serialized_job, now).await;
        }

        let entry_point = workflow.definition.entry_point().ok_or_else(|| {
            DefinitionError::Validation("workflow must have at least one step".to_string())
        })?;
        let execution = Execution {
            id: Uuid::now_v7(),
            idempotency_key: key.to_string(),
            serialized_job: serialized_job.to_string(),
            definition: workflow.definition.clone(),
            recover_to: entry_point,
            last_run_at: now,
            locked_at: Some(now),
        };

        match self.repository.insert(&execution).await {
            Ok(()) => {
                tracing::info!(
                    execution_id = %execution.id,
                    key,
                    workflow = workflow.definition.name.as_str(),
                    "admitted new execution"
                );
                Ok(Admission::Admitted(execution))
            }
            Err(RepositoryError::Conflict(_)) => {
                // Lost the first-insert race; the winner's row is
                // authoritative.
                let found = self
                    .repository
                    .find_by_key(key)
                    .await?
                    .ok_or(RepositoryError::NotFound)?;
                self.admit_existing(found, key, serialized_job, Utc::now())
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn admit_existing(
        &self,
        mut found: Execution,
        key: &str,
        serialized_job: &str,
        now: DateTime<Utc>,
    ) -> Result<Admission, EngineError> {
        if found.recover_to.is_finished() {
            return Ok(Admission::AlreadyFinished);
        }
        if found.serialized_job != serialized_job {
            return Err(EngineError::IdentityMismatch {
                key: key.to_string(),
            });
        }
        if let Some(locked_at) = found.locked_at {
            if now - locked_at < self.lock_timeout {
                return Err(EngineError::LockHeld {
                    key: key.to_string(),
                    locked_at,
                });
            }
        }

        let stale_before = now - self.lock_timeout;
        if !self
            .repository
            .acquire_lock(found.id, now, stale_before)
            .await?
        {
            return Err(EngineError::LockHeld {
                key: key.to_string(),
                locked_at: now,
            });
        }

        // An attempt after a recorded failure is a retry; make that
        // visible in the audit trail.
        if let Some(last) = self.repository.latest_entry(found.id).await? {
            if last.action == EntryAction::Errored {
                let step = found
                    .recover_to
                    .step_name()
                    .unwrap_or(last.step.as_str())
                    .to_string();
                self.repository
                    .append_entry(&Entry::new(found.id, step, EntryAction::Retried, json!({})))
                    .await?;
            }
        }

        found.locked_at = Some(now);
        found.last_run_at = now;
        tracing::info!(
            execution_id = %found.id,
            key,
            recover_to = %found.recover_to,
            "resumed execution"
        );
        Ok(Admission::Admitted(found))
    }

    /// Seed declared context defaults insert-if-absent, so steps can rely
    /// on the keys existing without guarding the first read.
    async fn seed_defaults(&self, execution: &Execution) -> Result<(), EngineError> {
        for (key, value) in &execution.definition.defaults {
            let encoded = self.registry.dump(&WorkflowValue::from_json(value.clone()))?;
            self.repository
                .store_value_if_absent(execution.id, key, &encoded)
                .await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    async fn run_loop(
        &self,
        execution: &mut Execution,
        workflow: &Workflow,
    ) -> Result<RunOutcome, EngineError> {
        let ops = EngineOps {
            repository: self.repository.as_ref(),
            queue: self.queue.as_ref(),
        };
        let mut phases = 0u32;
        // Mirrors the stored pointer; `execution.recover_to` runs ahead of
        // it during in-process repeats.
        let mut persisted_point = execution.recover_to.clone();

        loop {
            let (step_name, cursor) = match &execution.recover_to {
                RecoveryPoint::Finished => {
                    self.repository.release_lock(execution.id).await?;
                    tracing::info!(execution_id = %execution.id, "execution finished");
                    return Ok(RunOutcome::Finished);
                }
                RecoveryPoint::NotStarted => match workflow.definition.entry_point() {
                    Some(RecoveryPoint::Step { name, cursor }) => (name, cursor),
                    _ => {
                        self.repository.release_lock(execution.id).await?;
                        return Err(EngineError::UnknownRecoveryPoint {
                            point: String::new(),
                        });
                    }
                },
                RecoveryPoint::Step { name, cursor } => (name.clone(), *cursor),
            };

            phases += 1;
            if phases > self.phase_budget {
                self.repository.release_lock(execution.id).await?;
                return Err(EngineError::PhaseBudgetExhausted {
                    budget: self.phase_budget,
                });
            }

            let step_def = match workflow.definition.step(&step_name) {
                Some(def) => def,
                None => {
                    self.repository.release_lock(execution.id).await?;
                    return Err(EngineError::UnknownRecoveryPoint {
                        point: execution.recover_to.to_string(),
                    });
                }
            };
            let action = match workflow.action(&step_name) {
                Some(action) => action,
                None => {
                    self.repository.release_lock(execution.id).await?;
                    return Err(EngineError::UnknownRecoveryPoint {
                        point: execution.recover_to.to_string(),
                    });
                }
            };

            // `started` commits before the body runs.
            self.repository
                .append_entry(&Entry::new(
                    execution.id,
                    step_name.clone(),
                    EntryAction::Started,
                    json!({ "cursor": cursor }),
                ))
                .await?;
            tracing::debug!(
                execution_id = %execution.id,
                step = step_name.as_str(),
                cursor,
                "phase started"
            );

            let successor = workflow.definition.successor(&step_name)?;
            let mut ctx = StepContext::new(
                &ops,
                &self.registry,
                execution.id,
                step_name.clone(),
                cursor,
                successor.clone(),
            );
            let verdict = action.run(&mut ctx).await;
            let pending = ctx.take_pending();

            match verdict {
                Ok(verdict @ (StepVerdict::Continue | StepVerdict::Finish)) => {
                    let short_circuit = verdict == StepVerdict::Finish;
                    let next = if short_circuit {
                        RecoveryPoint::Finished
                    } else {
                        successor
                    };
                    let data = if short_circuit {
                        json!({ "short_circuit": true })
                    } else {
                        json!({})
                    };
                    let entry =
                        Entry::new(execution.id, step_name.clone(), EntryAction::Succeeded, data);

                    match step_def.transaction {
                        TransactionScope::ExecutionStore => {
                            self.repository
                                .commit_phase(execution.id, &next, &entry, &pending)
                                .await?;
                        }
                        TransactionScope::Disabled => {
                            for value in &pending {
                                self.repository
                                    .upsert_value(execution.id, &value.key, &value.value)
                                    .await?;
                            }
                            self.repository.append_entry(&entry).await?;
                            self.repository.advance(execution.id, &next).await?;
                        }
                    }
                    tracing::debug!(
                        execution_id = %execution.id,
                        step = step_name.as_str(),
                        next = %next,
                        "phase succeeded"
                    );
                    persisted_point = next.clone();
                    execution.recover_to = next;
                }
                Ok(StepVerdict::Halt | StepVerdict::HaltWorkflow) => {
                    for value in &pending {
                        self.repository
                            .upsert_value(execution.id, &value.key, &value.value)
                            .await?;
                    }
                    // The pointer keeps this step; only the iteration
                    // cursor may have moved. An unchanged pointer is never
                    // rewritten here, since a fast child of a just-dispatched cohort
                    // may already have advanced it.
                    let resting = RecoveryPoint::Step {
                        name: step_name.clone(),
                        cursor,
                    };
                    if resting != persisted_point {
                        self.repository.advance(execution.id, &resting).await?;
                    }
                    self.repository
                        .append_entry(&Entry::new(
                            execution.id,
                            step_name.clone(),
                            EntryAction::Halted,
                            json!({}),
                        ))
                        .await?;
                    self.repository.release_lock(execution.id).await?;
                    tracing::info!(
                        execution_id = %execution.id,
                        step = step_name.as_str(),
                        "halted awaiting resumption"
                    );
                    return Ok(RunOutcome::Halted { step: step_name });
                }
                Ok(StepVerdict::Repeat) => {
                    for value in &pending {
                        self.repository
                            .upsert_value(execution.id, &value.key, &value.value)
                            .await?;
                    }
                    // Pure control flow: no transition entry, no pointer
                    // write. The next pass re-enters this step with the
                    // cursor advanced.
                    execution.recover_to = RecoveryPoint::Step {
                        name: step_name,
                        cursor: cursor + 1,
                    };
                }
                Err(err) => {
                    // Durable regardless of any business writes the step
                    // rolled back.
                    self.repository
                        .append_entry(&Entry::new(
                            execution.id,
                            step_name.clone(),
                            EntryAction::Errored,
                            json!({ "class": "StepError", "message": err.to_string() }),
                        ))
                        .await?;
                    self.repository.release_lock(execution.id).await?;
                    tracing::warn!(
                        execution_id = %execution.id,
                        step = step_name.as_str(),
                        error = %err,
                        "phase errored"
                    );
                    return Err(EngineError::StepFailed {
                        step: step_name,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Join barrier
    // -----------------------------------------------------------------------

    /// Record one child-job completion against its fan-out cohort.
    ///
    /// Called by the host adapter after a child job commits its own work.
    /// Whichever child leaves no row unperformed advances the parent to
    /// the cohort's `progress_to` and re-enqueues the parent job; the
    /// pointer compare-and-set makes a racing double observation a no-op,
    /// so the parent resumes exactly once.
    pub async fn record_child_completion(
        &self,
        execution_id: Uuid,
        job_id: Uuid,
    ) -> Result<JoinOutcome, EngineError> {
        let now = Utc::now();
        if !self
            .repository
            .mark_job_performed(execution_id, job_id, now)
            .await?
        {
            return Ok(JoinOutcome::AlreadyRecorded);
        }

        let row = self
            .repository
            .get_batched_job(execution_id, job_id)
            .await?
            .ok_or(RepositoryError::NotFound)?;

        self.repository
            .append_entry(&Entry::new(
                execution_id,
                "batch",
                EntryAction::Completed,
                json!({ "job_id": job_id }),
            ))
            .await?;

        let outstanding = self.repository.outstanding_batched_jobs(execution_id).await?;
        if outstanding > 0 {
            tracing::debug!(
                execution_id = %execution_id,
                job_id = %job_id,
                outstanding,
                "cohort still outstanding"
            );
            return Ok(JoinOutcome::Pending { outstanding });
        }

        if !self.repository.advance(execution_id, &row.progress_to).await? {
            return Ok(JoinOutcome::AlreadyResumed);
        }

        if !row.progress_to.is_finished() {
            let parent = self
                .repository
                .find_by_id(execution_id)
                .await?
                .ok_or(RepositoryError::NotFound)?;
            let value = self.registry.load(&parent.serialized_job)?;
            let job = value.as_job().ok_or_else(|| {
                EngineError::Codec(CodecError::Malformed {
                    tag: "job".to_string(),
                    detail: "stored execution descriptor is not a job".to_string(),
                })
            })?;
            self.queue.enqueue(job, EnqueueOptions::default()).await?;
        }

        tracing::info!(
            execution_id = %execution_id,
            progress_to = %row.progress_to,
            "cohort complete, parent resumed"
        );
        Ok(JoinOutcome::Resumed {
            progress_to: row.progress_to,
        })
    }

    // -----------------------------------------------------------------------
    // Queries + retention
    // -----------------------------------------------------------------------

    /// The recovery pointer for a key: not-yet-finished runs report their
    /// resting step, finished runs the sentinel, unknown keys `None`.
    pub async fn status(&self, key: &str) -> Result<Option<RecoveryPoint>, EngineError> {
        Ok(self
            .repository
            .find_by_key(key)
            .await?
            .map(|e| e.recover_to))
    }

    /// The full audit trail for an execution, in transition order.
    pub async fn entries(&self, execution_id: Uuid) -> Result<Vec<Entry>, EngineError> {
        Ok(self.repository.list_entries(execution_id).await?)
    }

    /// Retention sweep: delete finished executions whose last attempt is
    /// older than `older_than_secs`. Owned rows cascade.
    pub async fn purge_finished(&self, older_than_secs: i64) -> Result<u64, EngineError> {
        let cutoff = Utc::now() - Duration::seconds(older_than_secs);
        let purged = self.repository.purge_finished_before(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, "retention sweep removed finished executions");
        }
        Ok(purged)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
