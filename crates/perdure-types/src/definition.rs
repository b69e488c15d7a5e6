//! Workflow definitions: the ordered step graph a run executes.
//!
//! A [`WorkflowDefinition`] is built once by the workflow author via
//! [`WorkflowDefinition::builder`] and persisted alongside each execution
//! as an opaque blob, so in-flight runs keep the graph they started with.
//! Validation enforces the structural constraints the recovery pointer
//! relies on (unique, colon-free step names and resolvable transitions).

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::RecoveryPoint;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from building or validating a workflow definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown step: '{0}'")]
    UnknownStep(String),
}

// ---------------------------------------------------------------------------
// TransactionScope
// ---------------------------------------------------------------------------

/// How a step's phase commit is wrapped.
///
/// `ExecutionStore` (the default) commits the pointer advance, buffered
/// context writes, and the succeeded entry in one transaction on the
/// engine's own store. `Disabled` issues them as independent writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionScope {
    #[default]
    ExecutionStore,
    Disabled,
}

// ---------------------------------------------------------------------------
// StepDefinition
// ---------------------------------------------------------------------------

/// A single step in the ordered graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within a workflow; may not contain ':'.
    pub name: String,
    /// Transition-target override. Absent means the next step in order
    /// (or finished, for the last step).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<String>,
    #[serde(default)]
    pub transaction: TransactionScope,
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// The ordered step graph plus declared context defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub steps: Vec<StepDefinition>,
    /// Context values seeded insert-if-absent at admission, so steps can
    /// rely on a key existing without guarding the first read.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults: BTreeMap<String, serde_json::Value>,
}

impl WorkflowDefinition {
    /// Start building a definition with the given workflow name.
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            steps: Vec::new(),
            defaults: BTreeMap::new(),
        }
    }

    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// The recovery point a brand-new run starts from.
    pub fn entry_point(&self) -> Option<RecoveryPoint> {
        self.steps.first().map(|s| RecoveryPoint::step(&s.name))
    }

    /// The recovery point reached after `name` succeeds: the `then`
    /// override if declared, the positional successor otherwise, and the
    /// finished sentinel after the last step.
    pub fn successor(&self, name: &str) -> Result<RecoveryPoint, DefinitionError> {
        let idx = self
            .steps
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| DefinitionError::UnknownStep(name.to_string()))?;

        if let Some(target) = &self.steps[idx].then {
            return Ok(RecoveryPoint::step(target));
        }
        match self.steps.get(idx + 1) {
            Some(next) => Ok(RecoveryPoint::step(&next.name)),
            None => Ok(RecoveryPoint::Finished),
        }
    }

    /// Validate structural constraints.
    ///
    /// Checks:
    /// - Name is non-empty, alphanumeric plus hyphens/underscores
    /// - At least one step exists
    /// - All step names are unique and colon-free
    /// - All `then` targets point to existing steps
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.is_empty() {
            return Err(DefinitionError::Validation(
                "workflow name must not be empty".to_string(),
            ));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DefinitionError::Validation(format!(
                "workflow name '{}' contains invalid characters",
                self.name
            )));
        }

        if self.steps.is_empty() {
            return Err(DefinitionError::Validation(
                "workflow must have at least one step".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name.is_empty() {
                return Err(DefinitionError::Validation(
                    "step name must not be empty".to_string(),
                ));
            }
            if step.name.contains(':') {
                return Err(DefinitionError::Validation(format!(
                    "step name '{}' may not contain ':'",
                    step.name
                )));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(DefinitionError::Validation(format!(
                    "duplicate step name: '{}'",
                    step.name
                )));
            }
        }

        for step in &self.steps {
            if let Some(target) = &step.then {
                if !seen.contains(target.as_str()) {
                    return Err(DefinitionError::UnknownStep(format!(
                        "step '{}' transitions to unknown step '{}'",
                        step.name, target
                    )));
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

/// Builder for [`WorkflowDefinition`]. Steps run in declaration order
/// unless a `then` override redirects the transition.
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<StepDefinition>,
    defaults: BTreeMap<String, serde_json::Value>,
}

impl WorkflowBuilder {
    /// Append a step with default options.
    pub fn step(self, name: impl Into<String>) -> Self {
        self.step_with(name, |s| s)
    }

    /// Append a step, customizing it through the closure.
    pub fn step_with(
        mut self,
        name: impl Into<String>,
        configure: impl FnOnce(StepDefinition) -> StepDefinition,
    ) -> Self {
        let step = StepDefinition {
            name: name.into(),
            then: None,
            transaction: TransactionScope::default(),
        };
        self.steps.push(configure(step));
        self
    }

    /// Declare a context default, seeded insert-if-absent at admission.
    pub fn default_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }

    /// Finish and validate the definition.
    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        let def = WorkflowDefinition {
            name: self.name,
            steps: self.steps,
            defaults: self.defaults,
        };
        def.validate()?;
        Ok(def)
    }
}

impl StepDefinition {
    /// Redirect this step's transition to a named step instead of the
    /// positional successor.
    pub fn then(mut self, target: impl Into<String>) -> Self {
        self.then = Some(target.into());
        self
    }

    /// Commit this step's phase as independent writes instead of one
    /// store transaction.
    pub fn non_transactional(mut self) -> Self {
        self.transaction = TransactionScope::Disabled;
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

    fn three_step() -> WorkflowDefinition {
        WorkflowDefinition::builder("invoice-flow")
            .step("create")
            .step("charge")
            .step("deliver")
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_preserves_order() {
        let def = three_step();
        let names: Vec<&str> = def.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["create", "charge", "deliver"]);
        assert_eq!(def.entry_point(), Some(RecoveryPoint::step("create")));
    }

    #[test]
    fn test_successor_positional_and_finished() {
        let def = three_step();
        assert_eq!(def.successor("create").unwrap(), RecoveryPoint::step("charge"));
        assert_eq!(def.successor("deliver").unwrap(), RecoveryPoint::Finished);
        assert!(def.successor("missing").is_err());
    }

    #[test]
    fn test_successor_then_override() {
        let def = WorkflowDefinition::builder("loop-back")
            .step_with("check", |s| s.then("deliver"))
            .step("charge")
            .step("deliver")
            .build()
            .unwrap();
        assert_eq!(def.successor("check").unwrap(), RecoveryPoint::step("deliver"));
    }

    #[test]
    fn test_validation_rejects_duplicate_step_names() {
        let err = WorkflowDefinition::builder("wf")
            .step("a")
            .step("a")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate step name"));
    }

    #[test]
    fn test_validation_rejects_colon_in_step_name() {
        let err = WorkflowDefinition::builder("wf")
            .step("bad:name")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("may not contain"));
    }

    #[test]
    fn test_validation_rejects_unknown_then_target() {
        let err = WorkflowDefinition::builder("wf")
            .step_with("a", |s| s.then("nowhere"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown step"));
    }

    #[test]
    fn test_validation_rejects_empty_workflow() {
        let err = WorkflowDefinition::builder("wf").build().unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn test_validation_rejects_bad_workflow_name() {
        let err = WorkflowDefinition::builder("has spaces!")
            .step("a")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("invalid characters"));
    }

    #[test]
    fn test_definition_json_roundtrip() {
        let def = WorkflowDefinition::builder("invoice-flow")
            .step_with("charge", |s| s.non_transactional())
            .step("deliver")
            .default_value("attempts", json!(0))
            .build()
            .unwrap();

        let blob = serde_json::to_string(&def).unwrap();
        let parsed: WorkflowDefinition = serde_json::from_str(&blob).unwrap();
        assert_eq!(parsed.name, "invoice-flow");
        assert_eq!(parsed.steps.len(), 2);
        assert_eq!(
            parsed.step("charge").unwrap().transaction,
            TransactionScope::Disabled
        );
        assert_eq!(parsed.defaults.get("attempts"), Some(&json!(0)));
    }
}
