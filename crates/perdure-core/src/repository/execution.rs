//! Execution repository trait definition.
//!
//! Defines the storage interface for workflow runs and everything they
//! own: audit entries, context values, and join-barrier rows. The
//! admission path leans on two guarantees the backend must provide: a
//! unique constraint on `idempotency_key` (so racing first-inserts resolve
//! to one winner) and compare-and-set updates for the lock and the
//! recovery pointer.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait
//! macro).

use chrono::{DateTime, Utc};
use perdure_types::error::RepositoryError;
use perdure_types::execution::{BatchedJob, ContextValue, Entry, Execution, RecoveryPoint};
use uuid::Uuid;

/// Repository trait for workflow-run persistence.
pub trait ExecutionRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Look up an execution by its idempotency key.
    fn find_by_key(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Look up an execution by row id.
    fn find_by_id(
        &self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Insert a brand-new execution. A duplicate idempotency key returns
    /// `RepositoryError::Conflict` (the admission race loser re-fetches).
    fn insert(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Compare-and-set lock acquisition: succeeds only when the row is
    /// unlocked or its lock is older than `stale_before`. Also bumps
    /// `last_run_at`. Returns whether the lock was taken.
    fn acquire_lock(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Clear the lock unconditionally.
    fn release_lock(
        &self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Move the recovery pointer. No effect (returns `false`) when the row
    /// is already finished or already at `to`; this is what makes
    /// join-barrier resumption idempotent.
    fn advance(
        &self,
        id: Uuid,
        to: &RecoveryPoint,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Atomically commit one succeeded phase: pointer advance, buffered
    /// context writes, and the terminal entry, all in one transaction.
    fn commit_phase(
        &self,
        id: Uuid,
        next: &RecoveryPoint,
        entry: &Entry,
        values: &[ContextValue],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete finished executions whose last attempt predates `cutoff`.
    /// Owned rows cascade. Returns how many executions were removed.
    fn purge_finished_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Audit entries
    // -----------------------------------------------------------------------

    /// Append one audit entry. Entries are never mutated or deleted.
    fn append_entry(
        &self,
        entry: &Entry,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All entries for an execution in `(created_at, insertion)` order.
    fn list_entries(
        &self,
        execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Entry>, RepositoryError>> + Send;

    /// The most recent entry for an execution, if any.
    fn latest_entry(
        &self,
        execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Entry>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Context values
    // -----------------------------------------------------------------------

    /// Read one context value's durable form.
    fn fetch_value(
        &self,
        execution_id: Uuid,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>, RepositoryError>> + Send;

    /// Insert a value unless the key already exists; either way, return
    /// the stored winner. Racing writers resolve to one durable value.
    fn store_value_if_absent(
        &self,
        execution_id: Uuid,
        key: &str,
        value: &str,
    ) -> impl std::future::Future<Output = Result<String, RepositoryError>> + Send;

    /// Insert or overwrite a value.
    fn upsert_value(
        &self,
        execution_id: Uuid,
        key: &str,
        value: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Join barrier
    // -----------------------------------------------------------------------

    /// Insert a fan-out cohort.
    fn insert_batched_jobs(
        &self,
        jobs: &[BatchedJob],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Remove rows never marked performed (inert leftovers of a crashed
    /// fan-out attempt). Returns how many were removed.
    fn delete_unperformed_batched_jobs(
        &self,
        execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Compare-and-set `performed_at`: succeeds only when the row exists
    /// and was not yet performed. Returns whether this call set it.
    fn mark_job_performed(
        &self,
        execution_id: Uuid,
        job_id: Uuid,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Look up one join-barrier row.
    fn get_batched_job(
        &self,
        execution_id: Uuid,
        job_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<BatchedJob>, RepositoryError>> + Send;

    /// How many of the execution's rows remain unperformed.
    fn outstanding_batched_jobs(
        &self,
        execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
