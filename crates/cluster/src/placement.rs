//! Placement policy hook and the default round-robin policy.

use std::sync::atomic::{AtomicUsize, Ordering};

use flowmesh_common::{Location, UnitId};

/// Constraints a topology builder passes along with an activation request.
#[derive(Debug, Clone, Default)]
pub struct PlacementHint {
    /// Never place the unit on this location (e.g. the originating client node).
    pub exclude: Option<Location>,
}

impl PlacementHint {
    pub fn excluding(location: Location) -> Self {
        Self {
            exclude: Some(location),
        }
    }
}

/// Pluggable placement decision for unit activation.
pub trait PlacementPolicy: Send + Sync {
    /// Choose a hosting location for `identity` among `nodes`.
    ///
    /// `nodes` is never empty. The hint's exclusion must be honored unless it
    /// would leave no candidate at all.
    fn place(&self, identity: &UnitId, hint: &PlacementHint, nodes: &[Location]) -> Location;
}

/// Default policy: rotate through non-excluded nodes in order.
#[derive(Debug, Default)]
pub struct RoundRobinPlacement {
    cursor: AtomicUsize,
}

impl RoundRobinPlacement {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlacementPolicy for RoundRobinPlacement {
    fn place(&self, _identity: &UnitId, hint: &PlacementHint, nodes: &[Location]) -> Location {
        let candidates: Vec<&Location> = nodes
            .iter()
            .filter(|n| hint.exclude.as_ref() != Some(*n))
            .collect();
        let pool: Vec<&Location> = if candidates.is_empty() {
            nodes.iter().collect()
        } else {
            candidates
        };
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        pool[i].clone()
    }
}

#[cfg(test)]
mod tests {
    use flowmesh_common::{OperatorId, WorkflowId};

    use super::*;

    fn unit(name: &str) -> UnitId {
        UnitId::new(WorkflowId(1), OperatorId(1), name)
    }

    fn nodes(names: &[&str]) -> Vec<Location> {
        names.iter().map(|n| Location::new(*n)).collect()
    }

    #[test]
    fn rotates_through_nodes() {
        let policy = RoundRobinPlacement::new();
        let nodes = nodes(&["n0", "n1", "n2"]);
        let hint = PlacementHint::default();
        let picks: Vec<Location> = (0..6)
            .map(|i| policy.place(&unit(&format!("u{i}")), &hint, &nodes))
            .collect();
        assert_eq!(picks[0], picks[3]);
        assert_eq!(picks[1], picks[4]);
        assert_eq!(picks[2], picks[5]);
    }

    #[test]
    fn honors_exclusion_hint() {
        let policy = RoundRobinPlacement::new();
        let nodes = nodes(&["client", "n1"]);
        let hint = PlacementHint::excluding(Location::new("client"));
        for i in 0..4 {
            let loc = policy.place(&unit(&format!("u{i}")), &hint, &nodes);
            assert_eq!(loc, Location::new("n1"));
        }
    }

    #[test]
    fn exclusion_yields_when_it_would_leave_no_candidate() {
        let policy = RoundRobinPlacement::new();
        let nodes = nodes(&["only"]);
        let hint = PlacementHint::excluding(Location::new("only"));
        let loc = policy.place(&unit("u0"), &hint, &nodes);
        assert_eq!(loc, Location::new("only"));
    }
}
