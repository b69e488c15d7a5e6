//! Storage port definitions.
//!
//! The engine talks to persistence exclusively through these traits; the
//! infrastructure layer (perdure-infra) implements them with SQLite.

pub mod execution;

pub use execution::ExecutionRepository;
