//! Built-in codecs for the serializer registry.
//!
//! Registered in order by `SerializerRegistry::with_defaults`: scalars,
//! ranges, error captures, entity records, job descriptors, recovery
//! points, then the recursive list/map codecs.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use perdure_types::error::CodecError;
use perdure_types::execution::RecoveryPoint;
use perdure_types::value::{EntityRecord, ErrorCapture, JobDescriptor, RangeValue, WorkflowValue};
use serde_json::json;

use super::{SerializerRegistry, ValueCodec};

fn malformed(tag: &str, detail: impl ToString) -> CodecError {
    CodecError::Malformed {
        tag: tag.to_string(),
        detail: detail.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Scalars
// ---------------------------------------------------------------------------

/// Null, booleans, integers, floats, and text, stored as plain JSON.
pub struct ScalarCodec;

impl ValueCodec for ScalarCodec {
    fn tag(&self) -> &'static str {
        "scalar"
    }

    fn applies(&self, value: &WorkflowValue) -> bool {
        matches!(
            value,
            WorkflowValue::Null
                | WorkflowValue::Bool(_)
                | WorkflowValue::Integer(_)
                | WorkflowValue::Float(_)
                | WorkflowValue::Text(_)
        )
    }

    fn encode(
        &self,
        value: &WorkflowValue,
        _registry: &SerializerRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        Ok(match value {
            WorkflowValue::Null => serde_json::Value::Null,
            WorkflowValue::Bool(b) => json!(b),
            WorkflowValue::Integer(i) => json!(i),
            WorkflowValue::Float(f) => json!(f),
            WorkflowValue::Text(s) => json!(s),
            _ => return Err(malformed(self.tag(), "not a scalar")),
        })
    }

    fn decode(
        &self,
        payload: &serde_json::Value,
        _registry: &SerializerRegistry,
    ) -> Result<WorkflowValue, CodecError> {
        match payload {
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                Err(malformed(self.tag(), "expected a scalar payload"))
            }
            other => Ok(WorkflowValue::from_json(other.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Ranges
// ---------------------------------------------------------------------------

pub struct RangeCodec;

impl ValueCodec for RangeCodec {
    fn tag(&self) -> &'static str {
        "range"
    }

    fn applies(&self, value: &WorkflowValue) -> bool {
        matches!(value, WorkflowValue::Range(_))
    }

    fn encode(
        &self,
        value: &WorkflowValue,
        _registry: &SerializerRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        match value {
            WorkflowValue::Range(range) => {
                serde_json::to_value(range).map_err(|e| malformed(self.tag(), e))
            }
            _ => Err(malformed(self.tag(), "not a range")),
        }
    }

    fn decode(
        &self,
        payload: &serde_json::Value,
        _registry: &SerializerRegistry,
    ) -> Result<WorkflowValue, CodecError> {
        let range: RangeValue =
            serde_json::from_value(payload.clone()).map_err(|e| malformed(self.tag(), e))?;
        Ok(WorkflowValue::Range(range))
    }
}

// ---------------------------------------------------------------------------
// Error captures
// ---------------------------------------------------------------------------

/// Captured errors. The backtrace is gzip-compressed and base64-encoded so
/// arbitrarily deep traces survive storage as a short text column.
pub struct ErrorCodec;

impl ErrorCodec {
    fn pack(frames: &[String]) -> Result<String, CodecError> {
        let joined = frames.join("\n");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(joined.as_bytes())
            .map_err(|e| malformed("error", e))?;
        let bytes = encoder.finish().map_err(|e| malformed("error", e))?;
        Ok(BASE64.encode(bytes))
    }

    fn unpack(packed: &str) -> Result<Vec<String>, CodecError> {
        let bytes = BASE64
            .decode(packed)
            .map_err(|e| malformed("error", e))?;
        let mut decoder = GzDecoder::new(&bytes[..]);
        let mut joined = String::new();
        decoder
            .read_to_string(&mut joined)
            .map_err(|e| malformed("error", e))?;
        if joined.is_empty() {
            return Ok(Vec::new());
        }
        Ok(joined.lines().map(String::from).collect())
    }
}

impl ValueCodec for ErrorCodec {
    fn tag(&self) -> &'static str {
        "error"
    }

    fn applies(&self, value: &WorkflowValue) -> bool {
        matches!(value, WorkflowValue::Error(_))
    }

    fn encode(
        &self,
        value: &WorkflowValue,
        _registry: &SerializerRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        match value {
            WorkflowValue::Error(capture) => Ok(json!({
                "class": capture.class,
                "message": capture.message,
                "backtrace": Self::pack(&capture.backtrace)?,
            })),
            _ => Err(malformed(self.tag(), "not an error capture")),
        }
    }

    fn decode(
        &self,
        payload: &serde_json::Value,
        _registry: &SerializerRegistry,
    ) -> Result<WorkflowValue, CodecError> {
        let class = payload
            .get("class")
            .and_then(|v| v.as_str())
            .ok_or_else(|| malformed(self.tag(), "missing class"))?;
        let message = payload
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| malformed(self.tag(), "missing message"))?;
        let packed = payload
            .get("backtrace")
            .and_then(|v| v.as_str())
            .ok_or_else(|| malformed(self.tag(), "missing backtrace"))?;
        Ok(WorkflowValue::Error(
            ErrorCapture::new(class, message).with_backtrace(Self::unpack(packed)?),
        ))
    }
}

// ---------------------------------------------------------------------------
// Entity records
// ---------------------------------------------------------------------------

/// Not-yet-persisted domain entities: class identifier plus attribute map,
/// decoded as a fresh unsaved record.
pub struct EntityCodec;

impl ValueCodec for EntityCodec {
    fn tag(&self) -> &'static str {
        "entity"
    }

    fn applies(&self, value: &WorkflowValue) -> bool {
        matches!(value, WorkflowValue::Entity(_))
    }

    fn encode(
        &self,
        value: &WorkflowValue,
        _registry: &SerializerRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        match value {
            WorkflowValue::Entity(record) => {
                serde_json::to_value(record).map_err(|e| malformed(self.tag(), e))
            }
            _ => Err(malformed(self.tag(), "not an entity record")),
        }
    }

    fn decode(
        &self,
        payload: &serde_json::Value,
        _registry: &SerializerRegistry,
    ) -> Result<WorkflowValue, CodecError> {
        let record: EntityRecord =
            serde_json::from_value(payload.clone()).map_err(|e| malformed(self.tag(), e))?;
        Ok(WorkflowValue::Entity(record))
    }
}

// ---------------------------------------------------------------------------
// Job descriptors
// ---------------------------------------------------------------------------

pub struct JobCodec;

impl ValueCodec for JobCodec {
    fn tag(&self) -> &'static str {
        "job"
    }

    fn applies(&self, value: &WorkflowValue) -> bool {
        matches!(value, WorkflowValue::Job(_))
    }

    fn encode(
        &self,
        value: &WorkflowValue,
        _registry: &SerializerRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        match value {
            WorkflowValue::Job(job) => {
                serde_json::to_value(job).map_err(|e| malformed(self.tag(), e))
            }
            _ => Err(malformed(self.tag(), "not a job descriptor")),
        }
    }

    fn decode(
        &self,
        payload: &serde_json::Value,
        _registry: &SerializerRegistry,
    ) -> Result<WorkflowValue, CodecError> {
        let job: JobDescriptor =
            serde_json::from_value(payload.clone()).map_err(|e| malformed(self.tag(), e))?;
        Ok(WorkflowValue::Job(job))
    }
}

// ---------------------------------------------------------------------------
// Recovery points
// ---------------------------------------------------------------------------

pub struct PointCodec;

impl ValueCodec for PointCodec {
    fn tag(&self) -> &'static str {
        "point"
    }

    fn applies(&self, value: &WorkflowValue) -> bool {
        matches!(value, WorkflowValue::Point(_))
    }

    fn encode(
        &self,
        value: &WorkflowValue,
        _registry: &SerializerRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        match value {
            WorkflowValue::Point(point) => Ok(json!(point.to_string())),
            _ => Err(malformed(self.tag(), "not a recovery point")),
        }
    }

    fn decode(
        &self,
        payload: &serde_json::Value,
        _registry: &SerializerRegistry,
    ) -> Result<WorkflowValue, CodecError> {
        let raw = payload
            .as_str()
            .ok_or_else(|| malformed(self.tag(), "expected a string"))?;
        let point: RecoveryPoint = raw.parse().unwrap_or(RecoveryPoint::NotStarted);
        Ok(WorkflowValue::Point(point))
    }
}

// ---------------------------------------------------------------------------
// Collections (recursive)
// ---------------------------------------------------------------------------

/// Ordered collections. Elements recurse through the registry so nested
/// special values keep their own codecs.
pub struct ListCodec;

impl ValueCodec for ListCodec {
    fn tag(&self) -> &'static str {
        "list"
    }

    fn applies(&self, value: &WorkflowValue) -> bool {
        matches!(value, WorkflowValue::List(_))
    }

    fn encode(
        &self,
        value: &WorkflowValue,
        registry: &SerializerRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        match value {
            WorkflowValue::List(items) => {
                let encoded: Result<Vec<_>, _> =
                    items.iter().map(|v| registry.encode_value(v)).collect();
                Ok(serde_json::Value::Array(encoded?))
            }
            _ => Err(malformed(self.tag(), "not a list")),
        }
    }

    fn decode(
        &self,
        payload: &serde_json::Value,
        registry: &SerializerRegistry,
    ) -> Result<WorkflowValue, CodecError> {
        let items = payload
            .as_array()
            .ok_or_else(|| malformed(self.tag(), "expected an array"))?;
        let decoded: Result<Vec<_>, _> =
            items.iter().map(|v| registry.decode_value(v)).collect();
        Ok(WorkflowValue::List(decoded?))
    }
}

/// Keyed collections, recursing like [`ListCodec`].
pub struct MapCodec;

impl ValueCodec for MapCodec {
    fn tag(&self) -> &'static str {
        "map"
    }

    fn applies(&self, value: &WorkflowValue) -> bool {
        matches!(value, WorkflowValue::Map(_))
    }

    fn encode(
        &self,
        value: &WorkflowValue,
        registry: &SerializerRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        match value {
            WorkflowValue::Map(map) => {
                let mut encoded = serde_json::Map::new();
                for (key, v) in map {
                    encoded.insert(key.clone(), registry.encode_value(v)?);
                }
                Ok(serde_json::Value::Object(encoded))
            }
            _ => Err(malformed(self.tag(), "not a map")),
        }
    }

    fn decode(
        &self,
        payload: &serde_json::Value,
        registry: &SerializerRegistry,
    ) -> Result<WorkflowValue, CodecError> {
        let object = payload
            .as_object()
            .ok_or_else(|| malformed(self.tag(), "expected an object"))?;
        let mut decoded = BTreeMap::new();
        for (key, v) in object {
            decoded.insert(key.clone(), registry.decode_value(v)?);
        }
        Ok(WorkflowValue::Map(decoded))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_backtrace() {
        let frames = vec![
            "engine.rs:42 in execute_phase".to_string(),
            "mod.rs:118 in run".to_string(),
        ];
        let packed = ErrorCodec::pack(&frames).unwrap();
        assert_ne!(packed, frames.join("\n"));
        assert_eq!(ErrorCodec::unpack(&packed).unwrap(), frames);
    }

    #[test]
    fn test_pack_unpack_empty_backtrace() {
        let packed = ErrorCodec::pack(&[]).unwrap();
        assert_eq!(ErrorCodec::unpack(&packed).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        assert!(ErrorCodec::unpack("!!! not base64 !!!").is_err());
    }
}
