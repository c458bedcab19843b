//! Workflow descriptor: operator set, directed edges, derived start/end
//! operators, and dependency ordering for topology build.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use flowmesh_common::{FlowError, OperatorId, Result, WorkflowId};

use crate::operator::Operator;

/// A parsed plan: operators plus directed dataflow edges.
///
/// Start operators have no inbound edge; end operators no outbound edge.
pub struct Workflow {
    id: WorkflowId,
    operators: Vec<Arc<dyn Operator>>,
    edges: Vec<(OperatorId, OperatorId)>,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operator_ids: Vec<OperatorId> = self.operators.iter().map(|op| op.id()).collect();
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("operators", &operator_ids)
            .field("edges", &self.edges)
            .finish()
    }
}

impl Workflow {
    pub fn new(
        id: WorkflowId,
        operators: Vec<Arc<dyn Operator>>,
        edges: Vec<(OperatorId, OperatorId)>,
    ) -> Result<Self> {
        if operators.is_empty() {
            return Err(FlowError::InvalidTopology(
                "workflow must contain at least one operator".to_string(),
            ));
        }
        let mut known = HashSet::new();
        for op in &operators {
            if !known.insert(op.id()) {
                return Err(FlowError::InvalidTopology(format!(
                    "duplicate operator id {}",
                    op.id()
                )));
            }
        }
        let mut deduped = Vec::new();
        for (from, to) in edges {
            if !known.contains(&from) || !known.contains(&to) {
                return Err(FlowError::InvalidTopology(format!(
                    "edge {from} -> {to} references an unknown operator"
                )));
            }
            if from == to {
                return Err(FlowError::InvalidTopology(format!(
                    "operator {from} cannot feed itself"
                )));
            }
            if !deduped.contains(&(from, to)) {
                deduped.push((from, to));
            }
        }

        let workflow = Self {
            id,
            operators,
            edges: deduped,
        };
        // Cycle detection up front: a cyclic plan must fail at construction,
        // not at build.
        workflow.topo_order()?;
        Ok(workflow)
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn operators(&self) -> &[Arc<dyn Operator>] {
        &self.operators
    }

    pub fn operator(&self, id: OperatorId) -> Option<&Arc<dyn Operator>> {
        self.operators.iter().find(|op| op.id() == id)
    }

    pub fn edges(&self) -> &[(OperatorId, OperatorId)] {
        &self.edges
    }

    pub fn upstream_of(&self, id: OperatorId) -> Vec<OperatorId> {
        self.edges
            .iter()
            .filter(|(_, to)| *to == id)
            .map(|(from, _)| *from)
            .collect()
    }

    pub fn downstream_of(&self, id: OperatorId) -> Vec<OperatorId> {
        self.edges
            .iter()
            .filter(|(from, _)| *from == id)
            .map(|(_, to)| *to)
            .collect()
    }

    /// Operators with no inbound edge.
    pub fn start_operators(&self) -> Vec<OperatorId> {
        self.operators
            .iter()
            .map(|op| op.id())
            .filter(|id| self.upstream_of(*id).is_empty())
            .collect()
    }

    /// Operators with no outbound edge.
    pub fn end_operators(&self) -> Vec<OperatorId> {
        self.operators
            .iter()
            .map(|op| op.id())
            .filter(|id| self.downstream_of(*id).is_empty())
            .collect()
    }

    /// Dependency order, sources before sinks (Kahn's algorithm).
    pub fn topo_order(&self) -> Result<Vec<OperatorId>> {
        let mut in_degree: HashMap<OperatorId, usize> =
            self.operators.iter().map(|op| (op.id(), 0)).collect();
        for (_, to) in &self.edges {
            if let Some(d) = in_degree.get_mut(to) {
                *d += 1;
            }
        }

        let mut ready: Vec<OperatorId> = self
            .operators
            .iter()
            .map(|op| op.id())
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.operators.len());

        while let Some(id) = ready.pop() {
            order.push(id);
            for next in self.downstream_of(id) {
                if let Some(d) = in_degree.get_mut(&next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(next);
                    }
                }
            }
        }

        if order.len() != self.operators.len() {
            return Err(FlowError::InvalidTopology(
                "workflow contains a cycle".to_string(),
            ));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::operator::Topology;

    struct StubOperator(OperatorId);

    impl Operator for StubOperator {
        fn id(&self) -> OperatorId {
            self.0
        }
        fn generate_topology(&self) -> Result<Topology> {
            Ok(Topology {
                layers: vec![],
                links: vec![],
            })
        }
    }

    fn ops(ids: &[u64]) -> Vec<Arc<dyn Operator>> {
        ids.iter()
            .map(|i| Arc::new(StubOperator(OperatorId(*i))) as Arc<dyn Operator>)
            .collect()
    }

    #[test]
    fn derives_start_and_end_operators() {
        let wf = Workflow::new(
            WorkflowId(1),
            ops(&[1, 2, 3]),
            vec![(OperatorId(1), OperatorId(2)), (OperatorId(2), OperatorId(3))],
        )
        .expect("workflow");
        assert_eq!(wf.start_operators(), vec![OperatorId(1)]);
        assert_eq!(wf.end_operators(), vec![OperatorId(3)]);
    }

    #[test]
    fn topo_order_respects_dependencies() {
        let wf = Workflow::new(
            WorkflowId(1),
            ops(&[1, 2, 3, 4]),
            vec![
                (OperatorId(1), OperatorId(3)),
                (OperatorId(2), OperatorId(3)),
                (OperatorId(3), OperatorId(4)),
            ],
        )
        .expect("workflow");
        let order = wf.topo_order().expect("order");
        let pos: HashSet<(usize, OperatorId)> =
            order.iter().enumerate().map(|(i, id)| (i, *id)).collect();
        let index = |id: OperatorId| {
            pos.iter()
                .find(|(_, x)| *x == id)
                .map(|(i, _)| *i)
                .expect("present")
        };
        assert!(index(OperatorId(1)) < index(OperatorId(3)));
        assert!(index(OperatorId(2)) < index(OperatorId(3)));
        assert!(index(OperatorId(3)) < index(OperatorId(4)));
    }

    #[test]
    fn cycle_is_invalid_topology() {
        let err = Workflow::new(
            WorkflowId(1),
            ops(&[1, 2]),
            vec![(OperatorId(1), OperatorId(2)), (OperatorId(2), OperatorId(1))],
        )
        .expect_err("must fail");
        assert!(matches!(err, FlowError::InvalidTopology(_)));
    }

    #[test]
    fn unknown_edge_endpoint_is_invalid() {
        let err = Workflow::new(
            WorkflowId(1),
            ops(&[1]),
            vec![(OperatorId(1), OperatorId(9))],
        )
        .expect_err("must fail");
        assert!(matches!(err, FlowError::InvalidTopology(_)));
    }
}
