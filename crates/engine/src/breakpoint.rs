//! Local and global breakpoints: a partitioned, epoch-versioned stopping
//! condition over running workers.
//!
//! The controller owns every [`GlobalBreakpoint`] and is its only mutator;
//! workers own at most one [`LocalBreakpoint`] per breakpoint id and report
//! back when it triggers. The `version` epoch ties a local assignment to one
//! partitioning round, so reports from superseded rounds are rejected.

use std::collections::HashSet;

use flowmesh_common::UnitId;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::tuple::Tuple;

/// Kind-specific local stopping state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocalBreakpointKind {
    /// Stop after observing `target` tuples.
    Count { current: u64, target: u64 },
}

/// Per-worker stopping condition, owned by exactly one worker at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalBreakpoint {
    id: String,
    version: u64,
    reported: bool,
    kind: LocalBreakpointKind,
}

impl LocalBreakpoint {
    pub fn count(id: impl Into<String>, version: u64, target: u64) -> Self {
        Self {
            id: id.into(),
            version,
            reported: false,
            kind: LocalBreakpointKind::Count { current: 0, target },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Observe one processed tuple.
    pub fn accept(&mut self, _tuple: &Tuple) {
        match &mut self.kind {
            LocalBreakpointKind::Count { current, .. } => *current += 1,
        }
    }

    pub fn is_triggered(&self) -> bool {
        match self.kind {
            LocalBreakpointKind::Count { current, target } => current >= target,
        }
    }

    /// Whether this worker still owes a report to the global owner.
    pub fn is_dirty(&self) -> bool {
        !self.reported
    }

    pub fn mark_reported(&mut self) {
        self.reported = true;
    }

    pub fn snapshot(&self) -> LocalBreakpointState {
        LocalBreakpointState {
            id: self.id.clone(),
            version: self.version,
            kind: self.kind.clone(),
        }
    }
}

/// Serializable report payload sent from a worker to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalBreakpointState {
    pub id: String,
    pub version: u64,
    pub kind: LocalBreakpointKind,
}

/// Kind-specific global aggregate.
#[derive(Debug, Clone)]
enum GlobalBreakpointKind {
    Count { current: u64, target: u64 },
}

/// One epoch's partitioning outcome.
#[derive(Debug)]
pub struct PartitionOutcome {
    /// Fresh local assignments for the new epoch.
    pub assignments: Vec<(UnitId, LocalBreakpoint)>,
    /// Previously assigned workers no longer selected; their local
    /// breakpoints must be removed.
    pub removed: Vec<UnitId>,
}

/// Cluster-wide stopping condition owned by the controller.
///
/// Invariant: `un_reported ⊆ all`. Both sets are mutated only by the methods
/// below, which the controller calls from its own command loop — single-owner
/// discipline instead of locks.
#[derive(Debug)]
pub struct GlobalBreakpoint {
    id: String,
    version: u64,
    all: HashSet<UnitId>,
    un_reported: HashSet<UnitId>,
    kind: GlobalBreakpointKind,
}

impl GlobalBreakpoint {
    /// Stop once `target` tuples were processed across the assigned workers.
    pub fn count(id: impl Into<String>, target: u64) -> Self {
        Self {
            id: id.into(),
            version: 0,
            all: HashSet::new(),
            un_reported: HashSet::new(),
            kind: GlobalBreakpointKind::Count { current: 0, target },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn all_workers(&self) -> &HashSet<UnitId> {
        &self.all
    }

    pub fn un_reported_workers(&self) -> &HashSet<UnitId> {
        &self.un_reported
    }

    /// Start a new epoch: distribute the remaining stopping condition over
    /// `candidates` and reset the report bookkeeping.
    ///
    /// Count kind: even split with the remainder on the last worker; when
    /// the remaining count is smaller than the worker count, the whole
    /// remainder goes to one randomly chosen worker instead of near-zero
    /// partial targets.
    pub fn partition(&mut self, candidates: &[UnitId]) -> PartitionOutcome {
        self.version += 1;
        let assignments = self.partition_impl(candidates);

        let selected: HashSet<UnitId> = assignments.iter().map(|(w, _)| w.clone()).collect();
        let removed: Vec<UnitId> = self
            .all
            .iter()
            .filter(|w| !selected.contains(*w))
            .cloned()
            .collect();

        self.all = selected.clone();
        self.un_reported = selected;
        PartitionOutcome {
            assignments,
            removed,
        }
    }

    fn partition_impl(&self, candidates: &[UnitId]) -> Vec<(UnitId, LocalBreakpoint)> {
        if candidates.is_empty() {
            return Vec::new();
        }
        match self.kind {
            GlobalBreakpointKind::Count { current, target } => {
                let remaining = target.saturating_sub(current);
                let n = candidates.len() as u64;
                if remaining < n {
                    let chosen = rand::thread_rng().gen_range(0..candidates.len());
                    vec![(
                        candidates[chosen].clone(),
                        LocalBreakpoint::count(&self.id, self.version, remaining),
                    )]
                } else {
                    let share = remaining / n;
                    let rem = remaining % n;
                    candidates
                        .iter()
                        .enumerate()
                        .map(|(i, w)| {
                            let local_target =
                                share + if i as u64 == n - 1 { rem } else { 0 };
                            (
                                w.clone(),
                                LocalBreakpoint::count(&self.id, self.version, local_target),
                            )
                        })
                        .collect()
                }
            }
        }
    }

    /// Fold one worker report into the aggregate.
    ///
    /// Valid only when the report carries the current epoch and the sender
    /// still owes a report; stale or duplicate reports return `false` and
    /// mutate nothing.
    pub fn accept(&mut self, sender: &UnitId, state: &LocalBreakpointState) -> bool {
        if state.id != self.id
            || state.version != self.version
            || !self.un_reported.contains(sender)
        {
            return false;
        }
        self.un_reported.remove(sender);
        self.fold(state);
        true
    }

    fn fold(&mut self, state: &LocalBreakpointState) {
        match (&mut self.kind, &state.kind) {
            (
                GlobalBreakpointKind::Count { current, .. },
                LocalBreakpointKind::Count {
                    current: local_current,
                    ..
                },
            ) => *current += local_current,
        }
    }

    /// Clear the owed-report set after a collect round, regardless of which
    /// workers actually replied.
    pub fn clear_un_reported(&mut self) {
        self.un_reported.clear();
    }

    /// True once every assigned worker reported: a finer or coarser
    /// re-partition over surviving workers may be warranted.
    pub fn is_repartition_required(&self) -> bool {
        self.un_reported.is_empty()
    }

    pub fn is_triggered(&self) -> bool {
        match self.kind {
            GlobalBreakpointKind::Count { current, target } => current >= target,
        }
    }

    /// For the count kind, completion coincides with triggering.
    pub fn is_completed(&self) -> bool {
        self.is_triggered()
    }

    /// Human-readable summary of the aggregate.
    pub fn report(&self) -> String {
        match self.kind {
            GlobalBreakpointKind::Count { current, target } => {
                if current >= target {
                    format!("count breakpoint '{}' reached target {current} of {target}", self.id)
                } else {
                    format!("count breakpoint '{}' at {current} of {target}", self.id)
                }
            }
        }
    }
}
