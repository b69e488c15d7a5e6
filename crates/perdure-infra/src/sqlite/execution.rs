//! SQLite execution repository implementation.
//!
//! Implements `ExecutionRepository` from `perdure-core` using sqlx with
//! split read/write pools. Workflow definitions and job descriptors are
//! stored as opaque JSON/text blobs. Lock acquisition, pointer advance,
//! and join-barrier completion are compare-and-set UPDATEs whose
//! `rows_affected` tells the engine whether it won; the phase commit runs
//! in a real writer transaction.

use chrono::{DateTime, SecondsFormat, Utc};
use perdure_core::repository::ExecutionRepository;
use perdure_types::error::RepositoryError;
use perdure_types::execution::{
    BatchedJob, ContextValue, Entry, EntryAction, Execution, FINISHED_SENTINEL, RecoveryPoint,
};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ExecutionRepository`.
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    idempotency_key: String,
    serialized_job: String,
    definition: String,
    recover_to: String,
    last_run_at: String,
    locked_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            serialized_job: row.try_get("serialized_job")?,
            definition: row.try_get("definition")?,
            recover_to: row.try_get("recover_to")?,
            last_run_at: row.try_get("last_run_at")?,
            locked_at: row.try_get("locked_at")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        let id = parse_uuid(&self.id)?;
        let definition = serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid definition JSON: {e}")))?;
        let recover_to = self
            .recover_to
            .parse::<RecoveryPoint>()
            .unwrap_or(RecoveryPoint::NotStarted);
        let last_run_at = parse_datetime(&self.last_run_at)?;
        let locked_at = self.locked_at.as_deref().map(parse_datetime).transpose()?;

        Ok(Execution {
            id,
            idempotency_key: self.idempotency_key,
            serialized_job: self.serialized_job,
            definition,
            recover_to,
            last_run_at,
            locked_at,
        })
    }
}

struct EntryRow {
    id: String,
    execution_id: String,
    step: String,
    action: String,
    data: String,
    created_at: String,
}

impl EntryRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            step: row.try_get("step")?,
            action: row.try_get("action")?,
            data: row.try_get("data")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_entry(self) -> Result<Entry, RepositoryError> {
        let action: EntryAction = self
            .action
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        let data = serde_json::from_str(&self.data)
            .map_err(|e| RepositoryError::Query(format!("invalid entry data: {e}")))?;

        Ok(Entry {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            step: self.step,
            action,
            data,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct BatchedJobRow {
    execution_id: String,
    job_id: String,
    serialized_job: String,
    progress_to: String,
    performed_at: Option<String>,
    created_at: String,
}

impl BatchedJobRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            job_id: row.try_get("job_id")?,
            serialized_job: row.try_get("serialized_job")?,
            progress_to: row.try_get("progress_to")?,
            performed_at: row.try_get("performed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_batched_job(self) -> Result<BatchedJob, RepositoryError> {
        let progress_to = self
            .progress_to
            .parse::<RecoveryPoint>()
            .unwrap_or(RecoveryPoint::NotStarted);
        Ok(BatchedJob {
            execution_id: parse_uuid(&self.execution_id)?,
            job_id: parse_uuid(&self.job_id)?,
            serialized_job: self.serialized_job,
            progress_to,
            performed_at: self
                .performed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC3339 so stored timestamps compare correctly as text.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn insert_error(e: sqlx::Error, what: &str) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(format!("duplicate {what}"))
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteExecutionRepository {
    async fn find_by_key(&self, key: &str) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn insert(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(&execution.definition)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;

        sqlx::query(
            r#"INSERT INTO executions
               (id, idempotency_key, serialized_job, definition, recover_to, last_run_at, locked_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.idempotency_key)
        .bind(&execution.serialized_job)
        .bind(&definition_json)
        .bind(execution.recover_to.to_string())
        .bind(format_datetime(&execution.last_run_at))
        .bind(execution.locked_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| insert_error(e, "idempotency key"))?;

        Ok(())
    }

    async fn acquire_lock(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE executions SET locked_at = ?, last_run_at = ?
               WHERE id = ? AND (locked_at IS NULL OR locked_at < ?)"#,
        )
        .bind(format_datetime(&now))
        .bind(format_datetime(&now))
        .bind(id.to_string())
        .bind(format_datetime(&stale_before))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lock(&self, id: Uuid) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE executions SET locked_at = NULL WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn advance(&self, id: Uuid, to: &RecoveryPoint) -> Result<bool, RepositoryError> {
        let target = to.to_string();
        let result = sqlx::query(
            "UPDATE executions SET recover_to = ? WHERE id = ? AND recover_to != ? AND recover_to != ?",
        )
        .bind(&target)
        .bind(id.to_string())
        .bind(FINISHED_SENTINEL)
        .bind(&target)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn commit_phase(
        &self,
        id: Uuid,
        next: &RecoveryPoint,
        entry: &Entry,
        values: &[ContextValue],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        for value in values {
            sqlx::query(
                r#"INSERT INTO execution_values (execution_id, key, value, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?)
                   ON CONFLICT(execution_id, key) DO UPDATE SET
                     value = excluded.value,
                     updated_at = excluded.updated_at"#,
            )
            .bind(value.execution_id.to_string())
            .bind(&value.key)
            .bind(&value.value)
            .bind(format_datetime(&value.created_at))
            .bind(format_datetime(&value.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        }

        let data_json = serde_json::to_string(&entry.data)
            .map_err(|e| RepositoryError::Query(format!("serialize entry data: {e}")))?;
        sqlx::query(
            r#"INSERT INTO execution_entries (id, execution_id, step, action, data, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.id.to_string())
        .bind(entry.execution_id.to_string())
        .bind(&entry.step)
        .bind(entry.action.as_str())
        .bind(&data_json)
        .bind(format_datetime(&entry.created_at))
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        let target = next.to_string();
        sqlx::query(
            "UPDATE executions SET recover_to = ? WHERE id = ? AND recover_to != ? AND recover_to != ?",
        )
        .bind(&target)
        .bind(id.to_string())
        .bind(FINISHED_SENTINEL)
        .bind(&target)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn purge_finished_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM executions WHERE recover_to = ? AND last_run_at < ?")
                .bind(FINISHED_SENTINEL)
                .bind(format_datetime(&cutoff))
                .execute(&self.pool.writer)
                .await
                .map_err(query_error)?;

        Ok(result.rows_affected())
    }

    async fn append_entry(&self, entry: &Entry) -> Result<(), RepositoryError> {
        let data_json = serde_json::to_string(&entry.data)
            .map_err(|e| RepositoryError::Query(format!("serialize entry data: {e}")))?;

        sqlx::query(
            r#"INSERT INTO execution_entries (id, execution_id, step, action, data, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.id.to_string())
        .bind(entry.execution_id.to_string())
        .bind(&entry.step)
        .bind(entry.action.as_str())
        .bind(&data_json)
        .bind(format_datetime(&entry.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn list_entries(&self, execution_id: Uuid) -> Result<Vec<Entry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_entries WHERE execution_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = EntryRow::from_row(row).map_err(query_error)?;
            entries.push(r.into_entry()?);
        }
        Ok(entries)
    }

    async fn latest_entry(&self, execution_id: Uuid) -> Result<Option<Entry>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM execution_entries WHERE execution_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = EntryRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_entry()?))
            }
            None => Ok(None),
        }
    }

    async fn fetch_value(
        &self,
        execution_id: Uuid,
        key: &str,
    ) -> Result<Option<String>, RepositoryError> {
        let row = sqlx::query("SELECT value FROM execution_values WHERE execution_id = ? AND key = ?")
            .bind(execution_id.to_string())
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(row.try_get("value").map_err(query_error)?)),
            None => Ok(None),
        }
    }

    async fn store_value_if_absent(
        &self,
        execution_id: Uuid,
        key: &str,
        value: &str,
    ) -> Result<String, RepositoryError> {
        let now = format_datetime(&Utc::now());
        sqlx::query(
            r#"INSERT INTO execution_values (execution_id, key, value, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(execution_id, key) DO NOTHING"#,
        )
        .bind(execution_id.to_string())
        .bind(key)
        .bind(value)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        // Return the stored winner, ours or an earlier writer's.
        self.fetch_value(execution_id, key)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    async fn upsert_value(
        &self,
        execution_id: Uuid,
        key: &str,
        value: &str,
    ) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        sqlx::query(
            r#"INSERT INTO execution_values (execution_id, key, value, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(execution_id, key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = excluded.updated_at"#,
        )
        .bind(execution_id.to_string())
        .bind(key)
        .bind(value)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn insert_batched_jobs(&self, jobs: &[BatchedJob]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        for job in jobs {
            sqlx::query(
                r#"INSERT INTO batched_jobs
                   (execution_id, job_id, serialized_job, progress_to, performed_at, created_at)
                   VALUES (?, ?, ?, ?, ?, ?)"#,
            )
            .bind(job.execution_id.to_string())
            .bind(job.job_id.to_string())
            .bind(&job.serialized_job)
            .bind(job.progress_to.to_string())
            .bind(job.performed_at.as_ref().map(format_datetime))
            .bind(format_datetime(&job.created_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| insert_error(e, "batched job"))?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn delete_unperformed_batched_jobs(
        &self,
        execution_id: Uuid,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM batched_jobs WHERE execution_id = ? AND performed_at IS NULL",
        )
        .bind(execution_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected())
    }

    async fn mark_job_performed(
        &self,
        execution_id: Uuid,
        job_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE batched_jobs SET performed_at = ?
               WHERE execution_id = ? AND job_id = ? AND performed_at IS NULL"#,
        )
        .bind(format_datetime(&at))
        .bind(execution_id.to_string())
        .bind(job_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_batched_job(
        &self,
        execution_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<BatchedJob>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM batched_jobs WHERE execution_id = ? AND job_id = ?")
            .bind(execution_id.to_string())
            .bind(job_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = BatchedJobRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_batched_job()?))
            }
            None => Ok(None),
        }
    }

    async fn outstanding_batched_jobs(&self, execution_id: Uuid) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM batched_jobs WHERE execution_id = ? AND performed_at IS NULL",
        )
        .bind(execution_id.to_string())
        .fetch_one(&self.pool.reader)
        .await
        .map_err(query_error)?;

        Ok(count as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryJobQueue;
    use crate::sqlite::pool::DatabasePool;
    use perdure_core::engine::{
        JoinOutcome, RunOutcome, StepAction, StepContext, StepError, StepVerdict, Workflow,
        WorkflowEngine,
    };
    use perdure_core::serializer::SerializerRegistry;
    use perdure_types::definition::WorkflowDefinition;
    use perdure_types::value::{JobDescriptor, WorkflowValue};
    use serde_json::json;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn sample_definition() -> WorkflowDefinition {
        WorkflowDefinition::builder("invoice-flow")
            .step("create")
            .step("charge")
            .step("deliver")
            .build()
            .unwrap()
    }

    fn sample_execution() -> Execution {
        let definition = sample_definition();
        let entry_point = definition.entry_point().unwrap();
        Execution {
            id: Uuid::now_v7(),
            idempotency_key: format!("key-{}", Uuid::now_v7()),
            serialized_job: r#"{"t":"job","v":{"class":"ProcessInvoiceJob"}}"#.to_string(),
            definition,
            recover_to: entry_point,
            last_run_at: Utc::now(),
            locked_at: None,
        }
    }

    fn sample_batched_job(execution_id: Uuid) -> BatchedJob {
        BatchedJob {
            execution_id,
            job_id: Uuid::now_v7(),
            serialized_job: r#"{"t":"job","v":{"class":"ChildJob"}}"#.to_string(),
            progress_to: RecoveryPoint::step("deliver"),
            performed_at: None,
            created_at: Utc::now(),
        }
    }

    // -- Execution CRUD + locking --

    #[tokio::test]
    async fn test_insert_and_find_execution() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let execution = sample_execution();

        repo.insert(&execution).await.unwrap();

        let loaded = repo
            .find_by_key(&execution.idempotency_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, execution.id);
        assert_eq!(loaded.recover_to, RecoveryPoint::step("create"));
        assert_eq!(loaded.definition.steps.len(), 3);
        assert!(loaded.locked_at.is_none());

        let by_id = repo.find_by_id(execution.id).await.unwrap().unwrap();
        assert_eq!(by_id.idempotency_key, execution.idempotency_key);
    }

    #[tokio::test]
    async fn test_insert_duplicate_key_conflicts() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let execution = sample_execution();
        repo.insert(&execution).await.unwrap();

        let mut duplicate = sample_execution();
        duplicate.idempotency_key = execution.idempotency_key.clone();
        let err = repo.insert(&duplicate).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_acquire_lock_compare_and_set() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let execution = sample_execution();
        repo.insert(&execution).await.unwrap();

        let now = Utc::now();
        let stale_before = now - chrono::Duration::seconds(90);

        // Unlocked row: acquired.
        assert!(repo.acquire_lock(execution.id, now, stale_before).await.unwrap());
        // Fresh lock: refused.
        assert!(!repo.acquire_lock(execution.id, now, stale_before).await.unwrap());
        // Expired lock: taken over.
        let later = now + chrono::Duration::seconds(600);
        let later_stale = later - chrono::Duration::seconds(90);
        assert!(repo.acquire_lock(execution.id, later, later_stale).await.unwrap());

        repo.release_lock(execution.id).await.unwrap();
        let loaded = repo.find_by_id(execution.id).await.unwrap().unwrap();
        assert!(loaded.locked_at.is_none());
    }

    #[tokio::test]
    async fn test_advance_is_guarded() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let execution = sample_execution();
        repo.insert(&execution).await.unwrap();

        // Normal advance.
        assert!(repo
            .advance(execution.id, &RecoveryPoint::step("charge"))
            .await
            .unwrap());
        // Same target: no-op.
        assert!(!repo
            .advance(execution.id, &RecoveryPoint::step("charge"))
            .await
            .unwrap());
        // Finish, then the pointer is immutable.
        assert!(repo
            .advance(execution.id, &RecoveryPoint::Finished)
            .await
            .unwrap());
        assert!(!repo
            .advance(execution.id, &RecoveryPoint::step("create"))
            .await
            .unwrap());
        let loaded = repo.find_by_id(execution.id).await.unwrap().unwrap();
        assert!(loaded.recover_to.is_finished());
    }

    #[tokio::test]
    async fn test_commit_phase_writes_all_three() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let execution = sample_execution();
        repo.insert(&execution).await.unwrap();

        let entry = Entry::new(
            execution.id,
            "create",
            EntryAction::Succeeded,
            json!({}),
        );
        let values = vec![ContextValue::new(execution.id, "cursor", "{\"t\":\"scalar\",\"v\":1}")];
        repo.commit_phase(execution.id, &RecoveryPoint::step("charge"), &entry, &values)
            .await
            .unwrap();

        let loaded = repo.find_by_id(execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.recover_to, RecoveryPoint::step("charge"));
        let entries = repo.list_entries(execution.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, EntryAction::Succeeded);
        let value = repo.fetch_value(execution.id, "cursor").await.unwrap();
        assert_eq!(value.as_deref(), Some("{\"t\":\"scalar\",\"v\":1}"));
    }

    // -- Entries --

    #[tokio::test]
    async fn test_entries_keep_insertion_order_on_timestamp_ties() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let execution = sample_execution();
        repo.insert(&execution).await.unwrap();

        let shared = Utc::now();
        for action in [
            EntryAction::Started,
            EntryAction::Halted,
            EntryAction::Started,
            EntryAction::Succeeded,
        ] {
            let mut entry = Entry::new(execution.id, "charge", action, json!({}));
            entry.created_at = shared;
            repo.append_entry(&entry).await.unwrap();
        }

        let actions: Vec<EntryAction> = repo
            .list_entries(execution.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                EntryAction::Started,
                EntryAction::Halted,
                EntryAction::Started,
                EntryAction::Succeeded,
            ]
        );

        let latest = repo.latest_entry(execution.id).await.unwrap().unwrap();
        assert_eq!(latest.action, EntryAction::Succeeded);
    }

    // -- Context values --

    #[tokio::test]
    async fn test_store_value_if_absent_keeps_first_writer() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let execution = sample_execution();
        repo.insert(&execution).await.unwrap();

        let first = repo
            .store_value_if_absent(execution.id, "winner", "alpha")
            .await
            .unwrap();
        assert_eq!(first, "alpha");

        let second = repo
            .store_value_if_absent(execution.id, "winner", "beta")
            .await
            .unwrap();
        assert_eq!(second, "alpha", "second writer observes the first value");

        repo.upsert_value(execution.id, "winner", "gamma").await.unwrap();
        let value = repo.fetch_value(execution.id, "winner").await.unwrap();
        assert_eq!(value.as_deref(), Some("gamma"));
    }

    // -- Batched jobs --

    #[tokio::test]
    async fn test_batched_job_lifecycle() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let execution = sample_execution();
        repo.insert(&execution).await.unwrap();

        let jobs = vec![
            sample_batched_job(execution.id),
            sample_batched_job(execution.id),
        ];
        repo.insert_batched_jobs(&jobs).await.unwrap();
        assert_eq!(repo.outstanding_batched_jobs(execution.id).await.unwrap(), 2);

        let now = Utc::now();
        assert!(repo
            .mark_job_performed(execution.id, jobs[0].job_id, now)
            .await
            .unwrap());
        // Second report for the same row is refused.
        assert!(!repo
            .mark_job_performed(execution.id, jobs[0].job_id, now)
            .await
            .unwrap());
        // Unknown job id is refused.
        assert!(!repo
            .mark_job_performed(execution.id, Uuid::now_v7(), now)
            .await
            .unwrap());
        assert_eq!(repo.outstanding_batched_jobs(execution.id).await.unwrap(), 1);

        let loaded = repo
            .get_batched_job(execution.id, jobs[0].job_id)
            .await
            .unwrap()
            .unwrap();
        assert!(loaded.performed_at.is_some());
        assert_eq!(loaded.progress_to, RecoveryPoint::step("deliver"));

        // Only the unperformed row is deleted.
        assert_eq!(
            repo.delete_unperformed_batched_jobs(execution.id).await.unwrap(),
            1
        );
        assert_eq!(repo.outstanding_batched_jobs(execution.id).await.unwrap(), 0);
    }

    // -- Retention --

    #[tokio::test]
    async fn test_purge_cascades_owned_rows() {
        let pool = test_pool().await;
        let repo = SqliteExecutionRepository::new(pool.clone());
        let mut execution = sample_execution();
        execution.recover_to = RecoveryPoint::Finished;
        execution.last_run_at = Utc::now() - chrono::Duration::days(30);
        repo.insert(&execution).await.unwrap();

        repo.append_entry(&Entry::new(
            execution.id,
            "create",
            EntryAction::Started,
            json!({}),
        ))
        .await
        .unwrap();
        repo.upsert_value(execution.id, "cursor", "1").await.unwrap();
        repo.insert_batched_jobs(&[sample_batched_job(execution.id)])
            .await
            .unwrap();

        let purged = repo
            .purge_finished_before(Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, 1);

        assert!(repo.find_by_id(execution.id).await.unwrap().is_none());
        assert!(repo.list_entries(execution.id).await.unwrap().is_empty());
        let orphans: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM batched_jobs WHERE execution_id = ?")
                .bind(execution.id.to_string())
                .fetch_one(&pool.reader)
                .await
                .unwrap();
        assert_eq!(orphans, 0, "owned rows cascade with the execution");

        // Unfinished rows survive any cutoff.
        let open = sample_execution();
        repo.insert(&open).await.unwrap();
        let purged = repo
            .purge_finished_before(Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(purged, 0);
    }

    // -----------------------------------------------------------------------
    // Engine scenarios against the real store
    // -----------------------------------------------------------------------

    struct AlwaysContinue;

    impl StepAction for AlwaysContinue {
        fn run<'a>(
            &'a self,
            _ctx: &'a mut StepContext<'_>,
        ) -> Pin<Box<dyn Future<Output = Result<StepVerdict, StepError>> + Send + 'a>> {
            Box::pin(async { Ok(StepVerdict::Continue) })
        }
    }

    struct HaltOnce {
        attempts: AtomicU32,
    }

    impl HaltOnce {
        fn new() -> Self {
            Self {
                attempts: AtomicU32::new(0),
            }
        }
    }

    impl StepAction for HaltOnce {
        fn run<'a>(
            &'a self,
            _ctx: &'a mut StepContext<'_>,
        ) -> Pin<Box<dyn Future<Output = Result<StepVerdict, StepError>> + Send + 'a>> {
            Box::pin(async {
                if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(StepVerdict::Halt)
                } else {
                    Ok(StepVerdict::Continue)
                }
            })
        }
    }

    struct FanOutTwo;

    impl StepAction for FanOutTwo {
        fn run<'a>(
            &'a self,
            ctx: &'a mut StepContext<'_>,
        ) -> Pin<Box<dyn Future<Output = Result<StepVerdict, StepError>> + Send + 'a>> {
            Box::pin(async move {
                ctx.fan_out(vec![
                    JobDescriptor::new("ChildJob").with_arguments(vec![json!(1)]),
                    JobDescriptor::new("ChildJob").with_arguments(vec![json!(2)]),
                ])
                .await?;
                Ok(StepVerdict::Halt)
            })
        }
    }

    fn sqlite_engine(
        pool: DatabasePool,
        queue: Arc<InMemoryJobQueue>,
    ) -> WorkflowEngine<SqliteExecutionRepository, InMemoryJobQueue> {
        WorkflowEngine::new(
            Arc::new(SqliteExecutionRepository::new(pool)),
            queue,
            Arc::new(SerializerRegistry::with_defaults()),
        )
    }

    #[tokio::test]
    async fn test_halt_resume_scenario_on_sqlite() {
        let pool = test_pool().await;
        let queue = Arc::new(InMemoryJobQueue::new());
        let engine = sqlite_engine(pool, Arc::clone(&queue));

        let workflow = Workflow::new(sample_definition())
            .on("create", AlwaysContinue)
            .on("charge", HaltOnce::new())
            .on("deliver", AlwaysContinue);
        let job = JobDescriptor::new("ProcessInvoiceJob").with_arguments(vec![json!("inv-42")]);

        let outcome = engine.run("inv-42", &job, &workflow).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Halted {
                step: "charge".to_string()
            }
        );

        let outcome = engine.run("inv-42", &job, &workflow).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished);

        let execution = engine
            .repository()
            .find_by_key("inv-42")
            .await
            .unwrap()
            .unwrap();
        let transitions: Vec<(String, EntryAction)> = engine
            .entries(execution.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.step, e.action))
            .collect();
        let expected: Vec<(String, EntryAction)> = [
            ("create", EntryAction::Started),
            ("create", EntryAction::Succeeded),
            ("charge", EntryAction::Started),
            ("charge", EntryAction::Halted),
            ("charge", EntryAction::Started),
            ("charge", EntryAction::Succeeded),
            ("deliver", EntryAction::Started),
            ("deliver", EntryAction::Succeeded),
        ]
        .into_iter()
        .map(|(s, a)| (s.to_string(), a))
        .collect();
        assert_eq!(transitions, expected);
        assert!(execution.recover_to.is_finished());
    }

    #[tokio::test]
    async fn test_fan_out_join_scenario_on_sqlite() {
        let pool = test_pool().await;
        let queue = Arc::new(InMemoryJobQueue::new());
        let engine = sqlite_engine(pool, Arc::clone(&queue));

        let definition = WorkflowDefinition::builder("batcher")
            .step("fan")
            .step("after")
            .build()
            .unwrap();
        let workflow = Workflow::new(definition)
            .on("fan", FanOutTwo)
            .on("after", AlwaysContinue);
        let job = JobDescriptor::new("ParentJob");

        let outcome = engine.run("batch-1", &job, &workflow).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Halted {
                step: "fan".to_string()
            }
        );

        let children = queue.drain();
        assert_eq!(children.len(), 2);
        let execution = engine
            .repository()
            .find_by_key("batch-1")
            .await
            .unwrap()
            .unwrap();

        let first = engine
            .record_child_completion(execution.id, children[0].job.job_id.unwrap())
            .await
            .unwrap();
        assert_eq!(first, JoinOutcome::Pending { outstanding: 1 });

        let last = engine
            .record_child_completion(execution.id, children[1].job.job_id.unwrap())
            .await
            .unwrap();
        assert_eq!(
            last,
            JoinOutcome::Resumed {
                progress_to: RecoveryPoint::step("after")
            }
        );

        // Parent re-enqueued once; running it finishes the workflow.
        let requeued = queue.drain();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].job.class, "ParentJob");

        let outcome = engine.run("batch-1", &job, &workflow).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished);
    }

    #[tokio::test]
    async fn test_context_value_survives_store_roundtrip() {
        let pool = test_pool().await;
        let repo = SqliteExecutionRepository::new(pool);
        let execution = sample_execution();
        repo.insert(&execution).await.unwrap();

        let registry = SerializerRegistry::with_defaults();
        let encoded = registry.dump(&WorkflowValue::Integer(7)).unwrap();
        repo.upsert_value(execution.id, "cursor", &encoded).await.unwrap();

        let stored = repo.fetch_value(execution.id, "cursor").await.unwrap().unwrap();
        assert_eq!(registry.load(&stored).unwrap(), WorkflowValue::Integer(7));
    }
}
