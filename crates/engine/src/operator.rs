//! Operator contract: pure topology descriptors with no runtime state.

use std::collections::HashMap;

use flowmesh_common::{OperatorId, Result, UnitId};

use crate::controller::WorkerState;
use crate::layer::{BuildContext, ProcessorWorkerLayer, ProducerWorkerLayer, WorkerLayer};
use crate::link::LinkStrategy;
use crate::routing::RoutingKey;

/// One layer an operator contributes to the physical topology.
pub enum LayerBuilder {
    Producer(ProducerWorkerLayer),
    Processor(ProcessorWorkerLayer),
}

impl LayerBuilder {
    pub fn id(&self) -> &str {
        match self {
            Self::Producer(l) => &l.id,
            Self::Processor(l) => &l.id,
        }
    }

    pub fn num_workers(&self) -> usize {
        match self {
            Self::Producer(l) => l.num_workers,
            Self::Processor(l) => l.num_workers,
        }
    }

    pub(crate) async fn build(&self, ctx: &BuildContext<'_>) -> Result<WorkerLayer> {
        match self {
            Self::Producer(l) => l.build(ctx).await,
            Self::Processor(l) => l.build(ctx).await,
        }
    }
}

/// One operator's physical topology contribution: its layers in pipeline
/// order (first = entry, last = exit) plus any intra-operator links.
pub struct Topology {
    pub layers: Vec<LayerBuilder>,
    pub links: Vec<Box<dyn LinkStrategy>>,
}

/// Fixed routing requirement an operator declares for one inbound edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRouting {
    OneToOne,
    RoundRobin,
    AllToOne,
    HashShuffle(RoutingKey),
}

/// Static descriptor of one pipeline stage's topology shape.
///
/// Operators carry no mutable runtime state and are reusable as static plan
/// nodes; the physical topology shape is dictated directly by what they
/// declare here, with no cost-based planning in between.
pub trait Operator: Send + Sync {
    fn id(&self) -> OperatorId;

    /// Worker layers and intra-operator links this operator needs.
    fn generate_topology(&self) -> Result<Topology>;

    /// How this operator's entry layer receives input from `from`.
    fn input_routing(&self, _from: &OperatorId) -> InputRouting {
        InputRouting::RoundRobin
    }

    /// Routing-key extractor consumed by hash-shuffle links from `from`.
    fn routing_key(&self, from: &OperatorId) -> Option<RoutingKey> {
        match self.input_routing(from) {
            InputRouting::HashShuffle(key) => Some(key),
            _ => None,
        }
    }

    /// Whether this operator must wait for `from` to fully drain before its
    /// own output becomes meaningful (staged joins). Purely a descriptor
    /// hint; drain sequencing happens through end-of-stream propagation.
    fn is_staged(&self, _from: &OperatorId) -> bool {
        true
    }

    /// Workers a global breakpoint over this operator should be partitioned
    /// across. Default: still-running workers of the entry layer.
    fn breakpoint_workers(
        &self,
        layers: &[&WorkerLayer],
        states: &HashMap<UnitId, WorkerState>,
    ) -> Vec<UnitId> {
        layers
            .first()
            .map(|layer| {
                layer
                    .worker_ids()
                    .into_iter()
                    .filter(|w| states.get(w) != Some(&WorkerState::Completed))
                    .collect()
            })
            .unwrap_or_default()
    }
}
