//! Polymorphic serializer registry.
//!
//! Turns any [`WorkflowValue`] into a durable string and back, round-trip
//! equal. The registry is an ordered list of [`ValueCodec`] handlers; each
//! exposes a capability check plus a symmetric encode/decode pair, and the
//! first handler whose check matches wins. Collections recurse through the
//! registry, so a list may carry a job descriptor whose arguments carry an
//! entity, all in one durable blob.
//!
//! Wire form: `{"t": "<tag>", "v": <payload>}` as compact JSON. A value no
//! handler claims fails the dump with [`CodecError::Unserializable`]; a
//! payload with an unrecognized tag fails the load with
//! [`CodecError::UnknownTag`]. Data is never silently dropped.

use perdure_types::error::CodecError;
use perdure_types::value::WorkflowValue;

mod handlers;

pub use handlers::{
    EntityCodec, ErrorCodec, JobCodec, ListCodec, MapCodec, PointCodec, RangeCodec, ScalarCodec,
};

// ---------------------------------------------------------------------------
// ValueCodec
// ---------------------------------------------------------------------------

/// One typed encoder/decoder pair in the registry.
pub trait ValueCodec: Send + Sync {
    /// The wire tag this codec owns.
    fn tag(&self) -> &'static str;

    /// Capability check: does this codec handle the given value?
    fn applies(&self, value: &WorkflowValue) -> bool;

    /// Encode the value's payload (the registry adds the tag envelope).
    fn encode(
        &self,
        value: &WorkflowValue,
        registry: &SerializerRegistry,
    ) -> Result<serde_json::Value, CodecError>;

    /// Decode a payload previously produced by `encode`.
    fn decode(
        &self,
        payload: &serde_json::Value,
        registry: &SerializerRegistry,
    ) -> Result<WorkflowValue, CodecError>;
}

// ---------------------------------------------------------------------------
// SerializerRegistry
// ---------------------------------------------------------------------------

/// Process-wide, ordered codec registry. Stateless after construction and
/// safe to share across workers.
pub struct SerializerRegistry {
    codecs: Vec<Box<dyn ValueCodec>>,
}

impl SerializerRegistry {
    /// An empty registry. Use [`SerializerRegistry::with_defaults`] unless
    /// a test needs a restricted handler set.
    pub fn new() -> Self {
        Self { codecs: Vec::new() }
    }

    /// The full built-in handler set, registered in match order.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ScalarCodec));
        registry.register(Box::new(RangeCodec));
        registry.register(Box::new(ErrorCodec));
        registry.register(Box::new(EntityCodec));
        registry.register(Box::new(JobCodec));
        registry.register(Box::new(PointCodec));
        registry.register(Box::new(ListCodec));
        registry.register(Box::new(MapCodec));
        registry
    }

    /// Append a codec. Handlers are tried in registration order.
    pub fn register(&mut self, codec: Box<dyn ValueCodec>) {
        self.codecs.push(codec);
    }

    /// Encode a value to its durable string form.
    pub fn dump(&self, value: &WorkflowValue) -> Result<String, CodecError> {
        let envelope = self.encode_value(value)?;
        serde_json::to_string(&envelope).map_err(|e| CodecError::Malformed {
            tag: "envelope".to_string(),
            detail: e.to_string(),
        })
    }

    /// Decode a durable string back into a value.
    pub fn load(&self, raw: &str) -> Result<WorkflowValue, CodecError> {
        let envelope: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| CodecError::Malformed {
                tag: "envelope".to_string(),
                detail: e.to_string(),
            })?;
        self.decode_value(&envelope)
    }

    /// Encode one value into its tagged envelope. Used by recursive codecs.
    pub fn encode_value(&self, value: &WorkflowValue) -> Result<serde_json::Value, CodecError> {
        let codec = self
            .codecs
            .iter()
            .find(|c| c.applies(value))
            .ok_or_else(|| CodecError::Unserializable(describe(value)))?;
        let payload = codec.encode(value, self)?;
        Ok(serde_json::json!({ "t": codec.tag(), "v": payload }))
    }

    /// Decode one tagged envelope. Used by recursive codecs.
    pub fn decode_value(&self, envelope: &serde_json::Value) -> Result<WorkflowValue, CodecError> {
        let tag = envelope
            .get("t")
            .and_then(|t| t.as_str())
            .ok_or_else(|| CodecError::Malformed {
                tag: "envelope".to_string(),
                detail: "missing 't' tag".to_string(),
            })?;
        let payload = envelope.get("v").ok_or_else(|| CodecError::Malformed {
            tag: tag.to_string(),
            detail: "missing 'v' payload".to_string(),
        })?;
        let codec = self
            .codecs
            .iter()
            .find(|c| c.tag() == tag)
            .ok_or_else(|| CodecError::UnknownTag(tag.to_string()))?;
        codec.decode(payload, self)
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Short description of a value's shape for error messages.
fn describe(value: &WorkflowValue) -> String {
    match value {
        WorkflowValue::Null => "null".to_string(),
        WorkflowValue::Bool(_) => "bool".to_string(),
        WorkflowValue::Integer(_) => "integer".to_string(),
        WorkflowValue::Float(_) => "float".to_string(),
        WorkflowValue::Text(_) => "text".to_string(),
        WorkflowValue::List(items) => format!("list[{}]", items.len()),
        WorkflowValue::Map(map) => format!("map[{}]", map.len()),
        WorkflowValue::Range(_) => "range".to_string(),
        WorkflowValue::Error(e) => format!("error({})", e.class),
        WorkflowValue::Entity(e) => format!("entity({})", e.class),
        WorkflowValue::Job(j) => format!("job({})", j.class),
        WorkflowValue::Point(p) => format!("recovery point({p})"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
