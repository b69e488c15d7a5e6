use thiserror::Error;

/// Errors from repository operations (used by trait definitions in perdure-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from the serializer registry.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No registered handler claims this value.
    #[error("unserializable value: {0}")]
    Unserializable(String),

    /// A durable payload carries a type tag no handler recognizes.
    #[error("unknown type tag: '{0}'")]
    UnknownTag(String),

    /// A durable payload is structurally invalid for its tag.
    #[error("malformed payload for tag '{tag}': {detail}")]
    Malformed { tag: String, detail: String },
}

/// Errors from the host job-queue port.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("enqueue failed: {0}")]
    Dispatch(String),
}
