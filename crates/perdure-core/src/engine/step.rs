//! Dynamic step dispatch.
//!
//! A [`Workflow`] pairs a definition with a registry mapping each step
//! name to a polymorphic [`StepAction`]. The registry is built once by the
//! workflow author; the engine resolves the persisted recovery pointer
//! against it at run time and never falls back to reflective lookup.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use perdure_types::definition::WorkflowDefinition;
use perdure_types::error::{CodecError, QueueError, RepositoryError};

use super::context::StepContext;

// ---------------------------------------------------------------------------
// StepVerdict
// ---------------------------------------------------------------------------

/// Control signal returned by a step body.
///
/// Halt and repeat are ordinary values, never errors: the phase executor
/// inspects the verdict and the error channel stays reserved for real
/// failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepVerdict {
    /// Advance to the step's transition target (or finish after the last
    /// step).
    Continue,
    /// Pause at this step, cleanly returning control. Resumption is the
    /// step's own arrangement: a delayed re-enqueue or a fan-out cohort
    /// that re-triggers the run.
    Halt,
    /// Pause the whole run at this step. Durably identical to `Halt`;
    /// expresses intent at the call site.
    HaltWorkflow,
    /// Re-enter this step in-process with the iteration cursor advanced.
    /// No new state is persisted; this is pure control flow.
    Repeat,
    /// Short-circuit the run straight to the finished sentinel.
    Finish,
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors raised by step bodies.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Business-logic failure. Recorded durably, then surfaced to the host
    /// framework for its retry policy.
    #[error("step execution failed: {0}")]
    Failed(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }
}

// ---------------------------------------------------------------------------
// StepAction
// ---------------------------------------------------------------------------

/// A runnable step body.
///
/// Boxed-future return keeps the trait dyn-compatible so actions live in a
/// name-keyed registry as `Arc<dyn StepAction>`.
pub trait StepAction: Send + Sync {
    fn run<'a>(
        &'a self,
        ctx: &'a mut StepContext<'_>,
    ) -> Pin<Box<dyn Future<Output = Result<StepVerdict, StepError>> + Send + 'a>>;
}

/// Blanket adapter so plain async closures register as step actions.
pub struct FnStepAction<F>(pub F);

impl<F> StepAction for FnStepAction<F>
where
    F: for<'a> Fn(
            &'a mut StepContext<'_>,
        )
            -> Pin<Box<dyn Future<Output = Result<StepVerdict, StepError>> + Send + 'a>>
        + Send
        + Sync,
{
    fn run<'a>(
        &'a self,
        ctx: &'a mut StepContext<'_>,
    ) -> Pin<Box<dyn Future<Output = Result<StepVerdict, StepError>> + Send + 'a>> {
        (self.0)(ctx)
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A definition plus the step actions that execute it.
pub struct Workflow {
    pub definition: WorkflowDefinition,
    actions: HashMap<String, Arc<dyn StepAction>>,
}

impl Workflow {
    pub fn new(definition: WorkflowDefinition) -> Self {
        Self {
            definition,
            actions: HashMap::new(),
        }
    }

    /// Register the body for a named step.
    pub fn on(mut self, step: impl Into<String>, action: impl StepAction + 'static) -> Self {
        self.actions.insert(step.into(), Arc::new(action));
        self
    }

    /// Register a boxed-future closure as the body for a named step.
    pub fn on_fn<F>(self, step: impl Into<String>, f: F) -> Self
    where
        F: for<'a> Fn(
                &'a mut StepContext<'_>,
            ) -> Pin<
                Box<dyn Future<Output = Result<StepVerdict, StepError>> + Send + 'a>,
            > + Send
            + Sync
            + 'static,
    {
        self.on(step, FnStepAction(f))
    }

    /// Resolve a step name to its action.
    pub fn action(&self, step: &str) -> Option<Arc<dyn StepAction>> {
        self.actions.get(step).cloned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
