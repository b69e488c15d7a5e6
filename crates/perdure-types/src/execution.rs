//! Execution state for idempotent workflow runs.
//!
//! An [`Execution`] is one row per logical run, identified by its
//! idempotency key. It owns an append-only audit trail ([`Entry`]), a
//! persisted key/value context ([`ContextValue`]), and the join-barrier
//! rows for fanned-out child jobs ([`BatchedJob`]). The [`RecoveryPoint`]
//! is the persisted cursor a crashed or halted run resumes from.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::WorkflowDefinition;

// ---------------------------------------------------------------------------
// RecoveryPoint
// ---------------------------------------------------------------------------

/// Durable string form of the finished sentinel.
pub const FINISHED_SENTINEL: &str = "FINISHED";

/// The persisted cursor naming where a run resumes.
///
/// Durable string form: `""` (not started), `"<step>:<cursor>"` (paused at
/// a step with an iteration offset), or `"FINISHED"`. Once finished the
/// pointer never changes again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RecoveryPoint {
    NotStarted,
    Step { name: String, cursor: u32 },
    Finished,
}

impl RecoveryPoint {
    /// Pointer at the start of the named step.
    pub fn step(name: impl Into<String>) -> Self {
        RecoveryPoint::Step {
            name: name.into(),
            cursor: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, RecoveryPoint::Finished)
    }

    pub fn is_not_started(&self) -> bool {
        matches!(self, RecoveryPoint::NotStarted)
    }

    /// The step name, if the pointer rests on a step.
    pub fn step_name(&self) -> Option<&str> {
        match self {
            RecoveryPoint::Step { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The iteration offset within the current step (0 outside a step).
    pub fn cursor(&self) -> u32 {
        match self {
            RecoveryPoint::Step { cursor, .. } => *cursor,
            _ => 0,
        }
    }

    /// Same step, iteration offset advanced by one.
    pub fn advanced_cursor(&self) -> Self {
        match self {
            RecoveryPoint::Step { name, cursor } => RecoveryPoint::Step {
                name: name.clone(),
                cursor: cursor + 1,
            },
            other => other.clone(),
        }
    }
}

impl fmt::Display for RecoveryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryPoint::NotStarted => Ok(()),
            RecoveryPoint::Step { name, cursor } => write!(f, "{name}:{cursor}"),
            RecoveryPoint::Finished => f.write_str(FINISHED_SENTINEL),
        }
    }
}

impl FromStr for RecoveryPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(RecoveryPoint::NotStarted);
        }
        if s == FINISHED_SENTINEL {
            return Ok(RecoveryPoint::Finished);
        }
        // Step names may not contain ':' (enforced at definition build),
        // so the last segment is always the cursor.
        match s.rsplit_once(':') {
            Some((name, cursor)) => match cursor.parse::<u32>() {
                Ok(cursor) => Ok(RecoveryPoint::Step {
                    name: name.to_string(),
                    cursor,
                }),
                Err(_) => Ok(RecoveryPoint::step(s)),
            },
            None => Ok(RecoveryPoint::step(s)),
        }
    }
}

impl From<String> for RecoveryPoint {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(RecoveryPoint::NotStarted)
    }
}

impl From<RecoveryPoint> for String {
    fn from(p: RecoveryPoint) -> Self {
        p.to_string()
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One idempotent workflow run.
///
/// Created on first admission for a key and mutated only by the engine's
/// pointer advancement and lock transitions. Never deleted except by the
/// retention sweep over finished, stale rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// UUIDv7 row id.
    pub id: Uuid,
    /// Globally unique, immutable identity of the run.
    pub idempotency_key: String,
    /// Registry-encoded descriptor of the job that produced this run.
    /// Compared on admission to detect identity/argument mismatch.
    pub serialized_job: String,
    /// The step graph this run executes (persisted as an opaque blob).
    pub definition: WorkflowDefinition,
    /// Where the run resumes.
    pub recover_to: RecoveryPoint,
    /// Timestamp of the most recent attempt.
    pub last_run_at: DateTime<Utc>,
    /// Set while an attempt holds the run; stale locks self-heal after the
    /// engine's lock timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Entry (audit log)
// ---------------------------------------------------------------------------

/// Lifecycle transition recorded in the append-only audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryAction {
    Started,
    Succeeded,
    Halted,
    Retried,
    Iterated,
    Errored,
    Compensated,
    Skipped,
    Completed,
}

impl EntryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryAction::Started => "started",
            EntryAction::Succeeded => "succeeded",
            EntryAction::Halted => "halted",
            EntryAction::Retried => "retried",
            EntryAction::Iterated => "iterated",
            EntryAction::Errored => "errored",
            EntryAction::Compensated => "compensated",
            EntryAction::Skipped => "skipped",
            EntryAction::Completed => "completed",
        }
    }
}

impl FromStr for EntryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(EntryAction::Started),
            "succeeded" => Ok(EntryAction::Succeeded),
            "halted" => Ok(EntryAction::Halted),
            "retried" => Ok(EntryAction::Retried),
            "iterated" => Ok(EntryAction::Iterated),
            "errored" => Ok(EntryAction::Errored),
            "compensated" => Ok(EntryAction::Compensated),
            "skipped" => Ok(EntryAction::Skipped),
            "completed" => Ok(EntryAction::Completed),
            other => Err(format!("unknown entry action: '{other}'")),
        }
    }
}

/// One append-only audit record. Entries are never mutated or deleted;
/// sorted by `(created_at, insertion order)` they form the total order of
/// transitions for an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// UUIDv7 entry id.
    pub id: Uuid,
    /// Owning execution.
    pub execution_id: Uuid,
    /// Step the transition belongs to.
    pub step: String,
    pub action: EntryAction,
    /// Arbitrary structured payload (error captures, child-job ids, ...).
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Entry {
    pub fn new(
        execution_id: Uuid,
        step: impl Into<String>,
        action: EntryAction,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id,
            step: step.into(),
            action,
            data,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// ContextValue
// ---------------------------------------------------------------------------

/// One persisted context entry, unique per `(execution, key)`.
///
/// Written at most meaningfully-once per key through the context store's
/// fetch-if-absent path, so retried attempts observe the first attempt's
/// result instead of repeating non-idempotent work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextValue {
    pub execution_id: Uuid,
    pub key: String,
    /// Registry-encoded durable form.
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContextValue {
    pub fn new(execution_id: Uuid, key: impl Into<String>, value: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            key: key.into(),
            value: value.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// BatchedJob (join barrier)
// ---------------------------------------------------------------------------

/// Join-barrier row for one fanned-out child job.
///
/// `performed_at` is set exactly once when the child reports completion;
/// the child that leaves no row unperformed advances the parent to
/// `progress_to`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchedJob {
    pub execution_id: Uuid,
    pub job_id: Uuid,
    /// Registry-encoded child job descriptor.
    pub serialized_job: String,
    /// Recovery point the parent moves to once the whole cohort completes.
    pub progress_to: RecoveryPoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
