//! Engine and ports for idempotent, crash-recoverable step workflows.
//!
//! This crate defines the "ports" (the [`repository::ExecutionRepository`]
//! storage trait and the [`queue::JobQueue`] host-framework trait) that the
//! infrastructure layer implements, plus the behavior that runs on top of
//! them: the [`serializer`] registry that makes runtime values durable and
//! the [`engine`] that admits, locks, and executes workflow runs one atomic
//! phase at a time. It depends only on `perdure-types`, never on
//! `perdure-infra` or any database/IO crate.

pub mod engine;
pub mod queue;
pub mod repository;
pub mod serializer;

#[cfg(test)]
pub(crate) mod testing;
