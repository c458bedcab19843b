//! Typed identifiers shared across controller/engine components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable workflow identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable operator identifier within a workflow plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical cluster location (node) hosting worker units.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location(pub String);

impl Location {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally addressable worker-unit identity.
///
/// Unit names are derived as `{layer_id}{index}`, so rebuilding the topology
/// for the same operator yields the same addressable identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
    /// Workflow this unit belongs to.
    pub workflow: WorkflowId,
    /// Operator this unit realizes a stage of.
    pub operator: OperatorId,
    /// Layer-derived unit name, unique within the operator.
    pub name: String,
}

impl UnitId {
    pub fn new(workflow: WorkflowId, operator: OperatorId, name: impl Into<String>) -> Self {
        Self {
            workflow,
            operator,
            name: name.into(),
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}/op{}/{}", self.workflow, self.operator, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_id_display_is_stable() {
        let id = UnitId::new(WorkflowId(7), OperatorId(2), "ScanLayer0");
        assert_eq!(id.to_string(), "w7/op2/ScanLayer0");
    }
}
