//! The dynamic value universe the serializer registry closes over.
//!
//! [`WorkflowValue`] covers everything a workflow may durably carry:
//! scalars and collections (recursively), ranges, captured errors, unsaved
//! domain entities, runnable job descriptors, and recovery-point markers.
//! The registry in perdure-core owns the durable encoding; these types are
//! plain data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::RecoveryPoint;

// ---------------------------------------------------------------------------
// WorkflowValue
// ---------------------------------------------------------------------------

/// A runtime value a workflow can persist through the serializer registry.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<WorkflowValue>),
    Map(BTreeMap<String, WorkflowValue>),
    Range(RangeValue),
    Error(ErrorCapture),
    Entity(EntityRecord),
    Job(JobDescriptor),
    Point(RecoveryPoint),
}

impl WorkflowValue {
    /// Convert plain JSON into the value universe (numbers become
    /// `Integer` when they fit in i64, `Float` otherwise).
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => WorkflowValue::Null,
            serde_json::Value::Bool(b) => WorkflowValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => WorkflowValue::Integer(i),
                None => WorkflowValue::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => WorkflowValue::Text(s),
            serde_json::Value::Array(items) => {
                WorkflowValue::List(items.into_iter().map(WorkflowValue::from_json).collect())
            }
            serde_json::Value::Object(map) => WorkflowValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, WorkflowValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            WorkflowValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            WorkflowValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_job(&self) -> Option<&JobDescriptor> {
        match self {
            WorkflowValue::Job(job) => Some(job),
            _ => None,
        }
    }
}

impl From<i64> for WorkflowValue {
    fn from(i: i64) -> Self {
        WorkflowValue::Integer(i)
    }
}

impl From<bool> for WorkflowValue {
    fn from(b: bool) -> Self {
        WorkflowValue::Bool(b)
    }
}

impl From<&str> for WorkflowValue {
    fn from(s: &str) -> Self {
        WorkflowValue::Text(s.to_string())
    }
}

impl From<String> for WorkflowValue {
    fn from(s: String) -> Self {
        WorkflowValue::Text(s)
    }
}

// ---------------------------------------------------------------------------
// RangeValue
// ---------------------------------------------------------------------------

/// An integer range, inclusive or half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeValue {
    pub start: i64,
    pub end: i64,
    pub inclusive: bool,
}

impl RangeValue {
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            inclusive: false,
        }
    }

    pub fn inclusive(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            inclusive: true,
        }
    }

    pub fn contains(&self, v: i64) -> bool {
        if self.inclusive {
            v >= self.start && v <= self.end
        } else {
            v >= self.start && v < self.end
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorCapture
// ---------------------------------------------------------------------------

/// A captured error: class identifier, message, and backtrace frames.
///
/// The registry packs the backtrace (deflate + base64) so it survives
/// storage as text; in memory it stays a plain frame list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCapture {
    pub class: String,
    pub message: String,
    #[serde(default)]
    pub backtrace: Vec<String>,
}

impl ErrorCapture {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }

    pub fn with_backtrace(mut self, frames: Vec<String>) -> Self {
        self.backtrace = frames;
        self
    }

    /// Capture a live error value with its type name as the class.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        Self::new(std::any::type_name::<E>(), err.to_string())
    }
}

// ---------------------------------------------------------------------------
// EntityRecord
// ---------------------------------------------------------------------------

/// A not-yet-persisted domain entity: class identifier plus attribute map.
/// Decoding reconstructs a fresh, unsaved record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub class: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl EntityRecord {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// JobDescriptor
// ---------------------------------------------------------------------------

/// A runnable job: class identifier plus arguments, reconstructed by the
/// host adapter into a framework job instance. `job_id` is stamped when
/// the descriptor joins a fan-out cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub class: String,
    #[serde(default)]
    pub arguments: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

impl JobDescriptor {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            arguments: Vec::new(),
            job_id: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<serde_json::Value>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_scalars() {
        assert_eq!(WorkflowValue::from_json(json!(null)), WorkflowValue::Null);
        assert_eq!(
            WorkflowValue::from_json(json!(42)),
            WorkflowValue::Integer(42)
        );
        assert_eq!(
            WorkflowValue::from_json(json!(2.5)),
            WorkflowValue::Float(2.5)
        );
        assert_eq!(
            WorkflowValue::from_json(json!("hi")),
            WorkflowValue::Text("hi".to_string())
        );
    }

    #[test]
    fn test_from_json_nested() {
        let v = WorkflowValue::from_json(json!({"items": [1, 2], "ok": true}));
        match v {
            WorkflowValue::Map(map) => {
                assert_eq!(
                    map.get("items"),
                    Some(&WorkflowValue::List(vec![
                        WorkflowValue::Integer(1),
                        WorkflowValue::Integer(2),
                    ]))
                );
                assert_eq!(map.get("ok"), Some(&WorkflowValue::Bool(true)));
            }
            other => panic!("expected map, got {other:?}"),
        }
    }

    #[test]
    fn test_range_contains() {
        assert!(RangeValue::new(0, 3).contains(2));
        assert!(!RangeValue::new(0, 3).contains(3));
        assert!(RangeValue::inclusive(0, 3).contains(3));
    }

    #[test]
    fn test_error_capture_from_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let cap = ErrorCapture::from_error(&io);
        assert_eq!(cap.message, "disk full");
        assert!(cap.class.contains("io"));
    }

    #[test]
    fn test_job_descriptor_builder() {
        let id = Uuid::now_v7();
        let job = JobDescriptor::new("DeliverInvoiceJob")
            .with_arguments(vec![json!("inv-42")])
            .with_job_id(id);
        assert_eq!(job.class, "DeliverInvoiceJob");
        assert_eq!(job.job_id, Some(id));
    }
}
