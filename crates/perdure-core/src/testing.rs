//! In-memory test doubles for engine unit tests.
//!
//! `MemoryRepository` keeps the whole store under one mutex, which makes
//! the phase commit trivially atomic; `RecordingQueue` captures enqueued
//! jobs for assertions. Infrastructure-level behavior (real transactions,
//! SQL constraints) is covered in perdure-infra against SQLite.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use perdure_types::error::{QueueError, RepositoryError};
use perdure_types::execution::{BatchedJob, ContextValue, Entry, Execution, RecoveryPoint};
use perdure_types::value::JobDescriptor;
use uuid::Uuid;

use crate::queue::{EnqueueOptions, JobQueue};
use crate::repository::ExecutionRepository;

#[derive(Default)]
struct MemoryState {
    executions: Vec<Execution>,
    entries: Vec<Entry>,
    values: HashMap<(Uuid, String), String>,
    batched: Vec<BatchedJob>,
}

/// Mutex-guarded in-memory `ExecutionRepository`.
#[derive(Default)]
pub(crate) struct MemoryRepository {
    state: Mutex<MemoryState>,
    /// When set, the next `commit_phase` fails (simulating a commit that
    /// cannot go through after the step body already ran).
    pub(crate) fail_next_commit: AtomicBool,
}

impl MemoryRepository {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl ExecutionRepository for MemoryRepository {
    async fn find_by_key(&self, key: &str) -> Result<Option<Execution>, RepositoryError> {
        let state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        Ok(state
            .executions
            .iter()
            .find(|e| e.idempotency_key == key)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Execution>, RepositoryError> {
        let state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        Ok(state.executions.iter().find(|e| e.id == id).cloned())
    }

    async fn insert(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        if state
            .executions
            .iter()
            .any(|e| e.idempotency_key == execution.idempotency_key)
        {
            return Err(RepositoryError::Conflict(format!(
                "duplicate idempotency key: '{}'",
                execution.idempotency_key
            )));
        }
        state.executions.push(execution.clone());
        Ok(())
    }

    async fn acquire_lock(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        let Some(execution) = state.executions.iter_mut().find(|e| e.id == id) else {
            return Ok(false);
        };
        match execution.locked_at {
            Some(at) if at >= stale_before => Ok(false),
            _ => {
                execution.locked_at = Some(now);
                execution.last_run_at = now;
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, id: Uuid) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        if let Some(execution) = state.executions.iter_mut().find(|e| e.id == id) {
            execution.locked_at = None;
        }
        Ok(())
    }

    async fn advance(&self, id: Uuid, to: &RecoveryPoint) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        let Some(execution) = state.executions.iter_mut().find(|e| e.id == id) else {
            return Ok(false);
        };
        if execution.recover_to.is_finished() || execution.recover_to == *to {
            return Ok(false);
        }
        execution.recover_to = to.clone();
        Ok(true)
    }

    async fn commit_phase(
        &self,
        id: Uuid,
        next: &RecoveryPoint,
        entry: &Entry,
        values: &[ContextValue],
    ) -> Result<(), RepositoryError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(RepositoryError::Query("injected commit failure".to_string()));
        }
        let mut state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        for value in values {
            state
                .values
                .insert((id, value.key.clone()), value.value.clone());
        }
        state.entries.push(entry.clone());
        if let Some(execution) = state.executions.iter_mut().find(|e| e.id == id) {
            if !execution.recover_to.is_finished() {
                execution.recover_to = next.clone();
            }
        }
        Ok(())
    }

    async fn purge_finished_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        let doomed: Vec<Uuid> = state
            .executions
            .iter()
            .filter(|e| e.recover_to.is_finished() && e.last_run_at < cutoff)
            .map(|e| e.id)
            .collect();
        state.executions.retain(|e| !doomed.contains(&e.id));
        state.entries.retain(|e| !doomed.contains(&e.execution_id));
        state.values.retain(|(id, _), _| !doomed.contains(id));
        state.batched.retain(|b| !doomed.contains(&b.execution_id));
        Ok(doomed.len() as u64)
    }

    async fn append_entry(&self, entry: &Entry) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        state.entries.push(entry.clone());
        Ok(())
    }

    async fn list_entries(&self, execution_id: Uuid) -> Result<Vec<Entry>, RepositoryError> {
        let state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        let mut entries: Vec<Entry> = state
            .entries
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    async fn latest_entry(&self, execution_id: Uuid) -> Result<Option<Entry>, RepositoryError> {
        Ok(self.list_entries(execution_id).await?.pop())
    }

    async fn fetch_value(
        &self,
        execution_id: Uuid,
        key: &str,
    ) -> Result<Option<String>, RepositoryError> {
        let state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        Ok(state.values.get(&(execution_id, key.to_string())).cloned())
    }

    async fn store_value_if_absent(
        &self,
        execution_id: Uuid,
        key: &str,
        value: &str,
    ) -> Result<String, RepositoryError> {
        let mut state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        let stored = state
            .values
            .entry((execution_id, key.to_string()))
            .or_insert_with(|| value.to_string());
        Ok(stored.clone())
    }

    async fn upsert_value(
        &self,
        execution_id: Uuid,
        key: &str,
        value: &str,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        state
            .values
            .insert((execution_id, key.to_string()), value.to_string());
        Ok(())
    }

    async fn insert_batched_jobs(&self, jobs: &[BatchedJob]) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        for job in jobs {
            if state
                .batched
                .iter()
                .any(|b| b.execution_id == job.execution_id && b.job_id == job.job_id)
            {
                return Err(RepositoryError::Conflict(format!(
                    "duplicate batched job: {}",
                    job.job_id
                )));
            }
            state.batched.push(job.clone());
        }
        Ok(())
    }

    async fn delete_unperformed_batched_jobs(
        &self,
        execution_id: Uuid,
    ) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        let before = state.batched.len();
        state
            .batched
            .retain(|b| b.execution_id != execution_id || b.performed_at.is_some());
        Ok((before - state.batched.len()) as u64)
    }

    async fn mark_job_performed(
        &self,
        execution_id: Uuid,
        job_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        let Some(job) = state
            .batched
            .iter_mut()
            .find(|b| b.execution_id == execution_id && b.job_id == job_id)
        else {
            return Ok(false);
        };
        if job.performed_at.is_some() {
            return Ok(false);
        }
        job.performed_at = Some(at);
        Ok(true)
    }

    async fn get_batched_job(
        &self,
        execution_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<BatchedJob>, RepositoryError> {
        let state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        Ok(state
            .batched
            .iter()
            .find(|b| b.execution_id == execution_id && b.job_id == job_id)
            .cloned())
    }

    async fn outstanding_batched_jobs(&self, execution_id: Uuid) -> Result<u64, RepositoryError> {
        let state = self.state.lock().map_err(|_| RepositoryError::Connection)?;
        Ok(state
            .batched
            .iter()
            .filter(|b| b.execution_id == execution_id && b.performed_at.is_none())
            .count() as u64)
    }
}

/// Queue double that records every enqueue.
#[derive(Default)]
pub(crate) struct RecordingQueue {
    jobs: Mutex<Vec<(JobDescriptor, EnqueueOptions)>>,
}

impl RecordingQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn drain(&self) -> Vec<(JobDescriptor, EnqueueOptions)> {
        match self.jobs.lock() {
            Ok(mut jobs) => jobs.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }
}

impl JobQueue for RecordingQueue {
    async fn enqueue(
        &self,
        job: &JobDescriptor,
        options: EnqueueOptions,
    ) -> Result<(), QueueError> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| QueueError::Dispatch("queue poisoned".to_string()))?;
        jobs.push((job.clone(), options));
        Ok(())
    }
}
