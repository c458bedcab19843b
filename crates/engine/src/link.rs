//! Link strategies: wiring one source layer to one destination layer (or to
//! the workflow output) by installing a concrete send strategy on every
//! source worker.
//!
//! `link()` runs once per topology build, after both endpoint layers are
//! built. Structural violations (cardinality mismatches) fail fast before
//! any installation. Installation itself tolerates partial failure: a worker
//! whose install call fails is logged and skipped, the remaining workers
//! still get linked.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use flowmesh_cluster::UnitHandle;
use flowmesh_common::{EngineConfig, FlowError, Result};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::layer::{LayerRef, WorkerLayer};
use crate::output::OutputHub;
use crate::routing::RoutingKey;
use crate::send::{
    AllToOneSend, HashShuffleSend, ObserverSend, OneToOneSend, RoundRobinSend, SendStrategy,
};
use crate::sending::{RetryPolicy, SendingUnit};
use crate::worker::{ControlEvent, WorkerEvent};

/// Resolution context for one link execution.
pub struct LinkContext<'a> {
    pub layers: &'a HashMap<LayerRef, WorkerLayer>,
    pub hub: &'a Arc<OutputHub>,
    pub config: &'a EngineConfig,
}

impl LinkContext<'_> {
    fn layer(&self, layer_ref: &LayerRef) -> Result<&WorkerLayer> {
        self.layers.get(layer_ref).ok_or_else(|| {
            FlowError::InvalidTopology(format!(
                "layer '{}' of operator {} is not built",
                layer_ref.layer, layer_ref.operator
            ))
        })
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::from_config(self.config)
    }
}

/// Wiring algorithm connecting two layers (or a layer to the output boundary).
#[async_trait]
pub trait LinkStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn from_layer(&self) -> &LayerRef;

    /// `None` for terminal/output links.
    fn to_layer(&self) -> Option<&LayerRef>;

    /// Install send strategies on every worker of the source layer.
    async fn link(&self, ctx: &LinkContext<'_>) -> Result<()>;
}

/// Local receivers ride the flow-controlled path; remote receivers the plain
/// retry path.
fn sending_unit(
    source: &UnitHandle<WorkerEvent>,
    dest: &UnitHandle<WorkerEvent>,
    retry: RetryPolicy,
) -> SendingUnit {
    if source.location() == dest.location() {
        SendingUnit::flow_controlled(dest.clone(), retry)
    } else {
        SendingUnit::plain(dest.clone(), retry)
    }
}

async fn install_strategy(
    worker: &UnitHandle<WorkerEvent>,
    strategy: Box<dyn SendStrategy>,
) -> Result<()> {
    let (ack_tx, ack_rx) = oneshot::channel();
    worker
        .deliver(WorkerEvent::Control(ControlEvent::InstallSendStrategy {
            strategy,
            ack: ack_tx,
        }))
        .await?;
    ack_rx
        .await
        .map_err(|_| FlowError::Cluster(format!("install ack lost for {}", worker.identity())))
}

async fn add_expected_upstream(worker: &UnitHandle<WorkerEvent>, count: usize) -> Result<()> {
    let (ack_tx, ack_rx) = oneshot::channel();
    worker
        .deliver(WorkerEvent::Control(ControlEvent::AddExpectedUpstream {
            count,
            ack: ack_tx,
        }))
        .await?;
    ack_rx
        .await
        .map_err(|_| FlowError::Cluster(format!("expectation ack lost for {}", worker.identity())))
}

/// Install with partial-failure tolerance: a failed worker is skipped, not
/// rolled back.
async fn install_or_skip(
    link_name: &'static str,
    worker: &UnitHandle<WorkerEvent>,
    strategy: Box<dyn SendStrategy>,
) {
    if let Err(e) = install_strategy(worker, strategy).await {
        warn!(link = link_name, worker = %worker.identity(), error = %e, "send strategy install failed; worker skipped");
    }
}

async fn expect_or_skip(link_name: &'static str, worker: &UnitHandle<WorkerEvent>, count: usize) {
    if let Err(e) = add_expected_upstream(worker, count).await {
        warn!(link = link_name, worker = %worker.identity(), error = %e, "upstream expectation install failed");
    }
}

/// Pair source and destination workers: matching cluster locations first
/// (keeps traffic local where possible), then fill the remainder in identity
/// order. Requires equal counts.
fn pair_by_location<'a>(
    sources: &'a [UnitHandle<WorkerEvent>],
    dests: &'a [UnitHandle<WorkerEvent>],
) -> Vec<(&'a UnitHandle<WorkerEvent>, &'a UnitHandle<WorkerEvent>)> {
    let mut used = vec![false; dests.len()];
    let mut pairs = Vec::with_capacity(sources.len());
    let mut unmatched = Vec::new();

    for source in sources {
        let found = dests
            .iter()
            .enumerate()
            .find(|(i, d)| !used[*i] && d.location() == source.location())
            .map(|(i, _)| i);
        match found {
            Some(i) => {
                used[i] = true;
                pairs.push((source, &dests[i]));
            }
            None => unmatched.push(source),
        }
    }

    let free = dests
        .iter()
        .enumerate()
        .filter(|(i, _)| !used[*i])
        .map(|(_, d)| d);
    for (source, dest) in unmatched.into_iter().zip(free) {
        pairs.push((source, dest));
    }
    pairs
}

/// Pairs source and destination workers one-for-one; fails when the layer
/// cardinalities differ.
pub struct OneToOneLink {
    from: LayerRef,
    to: LayerRef,
    batch_size: usize,
}

impl OneToOneLink {
    pub fn new(from: LayerRef, to: LayerRef, batch_size: usize) -> Self {
        Self {
            from,
            to,
            batch_size,
        }
    }
}

#[async_trait]
impl LinkStrategy for OneToOneLink {
    fn name(&self) -> &'static str {
        "one_to_one"
    }

    fn from_layer(&self) -> &LayerRef {
        &self.from
    }

    fn to_layer(&self) -> Option<&LayerRef> {
        Some(&self.to)
    }

    async fn link(&self, ctx: &LinkContext<'_>) -> Result<()> {
        let from = ctx.layer(&self.from)?;
        let to = ctx.layer(&self.to)?;
        if from.len() != to.len() {
            return Err(FlowError::InvalidTopology(format!(
                "one-to-one link requires equal cardinality: '{}' has {} workers, '{}' has {}",
                from.id(),
                from.len(),
                to.id(),
                to.len()
            )));
        }

        let retry = ctx.retry();
        for (source, dest) in pair_by_location(from.workers(), to.workers()) {
            let mut strategy = OneToOneSend::new(self.batch_size);
            strategy.add_receiver(sending_unit(source, dest, retry));
            install_or_skip(self.name(), source, Box::new(strategy)).await;
        }
        for dest in to.workers() {
            expect_or_skip(self.name(), dest, 1).await;
        }
        info!(from = %from.id(), to = %to.id(), workers = from.len(), "one-to-one link installed");
        Ok(())
    }
}

/// Rotates every source worker across the full destination layer.
pub struct RoundRobinLink {
    from: LayerRef,
    to: LayerRef,
    batch_size: usize,
}

impl RoundRobinLink {
    pub fn new(from: LayerRef, to: LayerRef, batch_size: usize) -> Self {
        Self {
            from,
            to,
            batch_size,
        }
    }
}

#[async_trait]
impl LinkStrategy for RoundRobinLink {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn from_layer(&self) -> &LayerRef {
        &self.from
    }

    fn to_layer(&self) -> Option<&LayerRef> {
        Some(&self.to)
    }

    async fn link(&self, ctx: &LinkContext<'_>) -> Result<()> {
        let from = ctx.layer(&self.from)?;
        let to = ctx.layer(&self.to)?;
        if to.is_empty() {
            return Err(FlowError::InvalidTopology(format!(
                "round-robin link into empty layer '{}'",
                to.id()
            )));
        }

        let retry = ctx.retry();
        for source in from.workers() {
            let mut strategy = RoundRobinSend::new(self.batch_size);
            // Same-location destinations lead the rotation; isolated ones are
            // appended so no layer member is starved.
            let (local, remote): (Vec<_>, Vec<_>) = to
                .workers()
                .iter()
                .partition(|d| d.location() == source.location());
            for dest in local.into_iter().chain(remote) {
                strategy.add_receiver(sending_unit(source, dest, retry));
            }
            install_or_skip(self.name(), source, Box::new(strategy)).await;
        }
        for dest in to.workers() {
            expect_or_skip(self.name(), dest, from.len()).await;
        }
        info!(from = %from.id(), to = %to.id(), "round-robin link installed");
        Ok(())
    }
}

/// Funnels every source worker into a single-destination layer.
pub struct AllToOneLink {
    from: LayerRef,
    to: LayerRef,
    batch_size: usize,
}

impl AllToOneLink {
    pub fn new(from: LayerRef, to: LayerRef, batch_size: usize) -> Self {
        Self {
            from,
            to,
            batch_size,
        }
    }
}

#[async_trait]
impl LinkStrategy for AllToOneLink {
    fn name(&self) -> &'static str {
        "all_to_one"
    }

    fn from_layer(&self) -> &LayerRef {
        &self.from
    }

    fn to_layer(&self) -> Option<&LayerRef> {
        Some(&self.to)
    }

    async fn link(&self, ctx: &LinkContext<'_>) -> Result<()> {
        let from = ctx.layer(&self.from)?;
        let to = ctx.layer(&self.to)?;
        if to.len() != 1 {
            return Err(FlowError::InvalidTopology(format!(
                "all-to-one link requires destination cardinality 1, layer '{}' has {}",
                to.id(),
                to.len()
            )));
        }
        let dest = &to.workers()[0];

        let retry = ctx.retry();
        for source in from.workers() {
            let mut strategy = AllToOneSend::new(self.batch_size);
            strategy.add_receiver(sending_unit(source, dest, retry));
            install_or_skip(self.name(), source, Box::new(strategy)).await;
        }
        expect_or_skip(self.name(), dest, from.len()).await;
        info!(from = %from.id(), to = %to.id(), sources = from.len(), "all-to-one link installed");
        Ok(())
    }
}

/// Keyed shuffle from every source worker across the full destination layer.
pub struct HashShuffleLink {
    from: LayerRef,
    to: LayerRef,
    batch_size: usize,
    routing: RoutingKey,
}

impl HashShuffleLink {
    pub fn new(from: LayerRef, to: LayerRef, batch_size: usize, routing: RoutingKey) -> Self {
        Self {
            from,
            to,
            batch_size,
            routing,
        }
    }
}

#[async_trait]
impl LinkStrategy for HashShuffleLink {
    fn name(&self) -> &'static str {
        "hash_shuffle"
    }

    fn from_layer(&self) -> &LayerRef {
        &self.from
    }

    fn to_layer(&self) -> Option<&LayerRef> {
        Some(&self.to)
    }

    async fn link(&self, ctx: &LinkContext<'_>) -> Result<()> {
        let from = ctx.layer(&self.from)?;
        let to = ctx.layer(&self.to)?;
        if to.is_empty() {
            return Err(FlowError::InvalidTopology(format!(
                "hash-shuffle link into empty layer '{}'",
                to.id()
            )));
        }

        let retry = ctx.retry();
        for source in from.workers() {
            let mut strategy = HashShuffleSend::new(self.routing.clone(), self.batch_size);
            // Receiver order is the destination identity order for every
            // sender; keyed routing depends on a shared modulo domain.
            for dest in to.workers() {
                strategy.add_receiver(sending_unit(source, dest, retry));
            }
            install_or_skip(self.name(), source, Box::new(strategy)).await;
        }
        for dest in to.workers() {
            expect_or_skip(self.name(), dest, from.len()).await;
        }
        info!(from = %from.id(), to = %to.id(), "hash-shuffle link installed");
        Ok(())
    }
}

/// Terminal link attaching the output-stream strategy to every worker of an
/// end operator's exit layer.
pub struct ObserverLink {
    from: LayerRef,
    batch_size: usize,
}

impl ObserverLink {
    pub fn new(from: LayerRef, batch_size: usize) -> Self {
        Self { from, batch_size }
    }
}

#[async_trait]
impl LinkStrategy for ObserverLink {
    fn name(&self) -> &'static str {
        "observer"
    }

    fn from_layer(&self) -> &LayerRef {
        &self.from
    }

    fn to_layer(&self) -> Option<&LayerRef> {
        None
    }

    async fn link(&self, ctx: &LinkContext<'_>) -> Result<()> {
        let from = ctx.layer(&self.from)?;
        for source in from.workers() {
            let strategy =
                ObserverSend::new(Arc::clone(ctx.hub), from.workflow(), self.batch_size);
            install_or_skip(self.name(), source, Box::new(strategy)).await;
        }
        info!(from = %from.id(), senders = from.len(), "observer link installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use flowmesh_common::{OperatorId, WorkflowId};
    use tokio::sync::mpsc;

    use super::*;
    use crate::layer::{BuildContext, ProcessorWorkerLayer};
    use crate::processor::TupleProcessor;
    use crate::test_util::test_cluster;
    use crate::tuple::Tuple;

    struct NoopProcessor;

    impl TupleProcessor for NoopProcessor {
        fn accept(&mut self, _tuple: Tuple) -> Result<()> {
            Ok(())
        }
        fn has_next(&self) -> bool {
            false
        }
        fn next(&mut self) -> Option<Tuple> {
            None
        }
    }

    async fn built_layer(
        cluster: &flowmesh_cluster::Cluster<WorkerEvent>,
        notice: &mpsc::Sender<crate::worker::WorkerNotice>,
        config: &EngineConfig,
        operator: u64,
        id: &str,
        workers: usize,
    ) -> WorkerLayer {
        let ctx = BuildContext {
            cluster,
            workflow: WorkflowId(1),
            operator: OperatorId(operator),
            client_location: flowmesh_common::Location::new("client"),
            notice: notice.clone(),
            config,
        };
        ProcessorWorkerLayer::new(
            id,
            workers,
            Box::new(|_| Box::new(NoopProcessor) as Box<dyn TupleProcessor>),
        )
        .build(&ctx)
        .await
        .expect("build layer")
    }

    #[tokio::test]
    async fn one_to_one_requires_equal_cardinality() {
        let cluster = test_cluster();
        let (notice, _rx) = mpsc::channel(16);
        let config = EngineConfig::default();
        let hub = Arc::new(OutputHub::new());

        let from = built_layer(&cluster, &notice, &config, 1, "ScanLayer", 2).await;
        let to = built_layer(&cluster, &notice, &config, 2, "MapLayer", 3).await;
        let mut layers = HashMap::new();
        let from_ref = from.layer_ref();
        let to_ref = to.layer_ref();
        layers.insert(from_ref.clone(), from);
        layers.insert(to_ref.clone(), to);

        let ctx = LinkContext {
            layers: &layers,
            hub: &hub,
            config: &config,
        };
        let err = OneToOneLink::new(from_ref, to_ref, 4)
            .link(&ctx)
            .await
            .expect_err("must fail");
        assert!(matches!(err, FlowError::InvalidTopology(_)));
    }

    #[tokio::test]
    async fn all_to_one_requires_single_destination() {
        let cluster = test_cluster();
        let (notice, _rx) = mpsc::channel(16);
        let config = EngineConfig::default();
        let hub = Arc::new(OutputHub::new());

        let from = built_layer(&cluster, &notice, &config, 1, "ScanLayer", 2).await;
        let to = built_layer(&cluster, &notice, &config, 2, "SinkLayer", 2).await;
        let mut layers = HashMap::new();
        let from_ref = from.layer_ref();
        let to_ref = to.layer_ref();
        layers.insert(from_ref.clone(), from);
        layers.insert(to_ref.clone(), to);

        let ctx = LinkContext {
            layers: &layers,
            hub: &hub,
            config: &config,
        };
        let err = AllToOneLink::new(from_ref, to_ref, 4)
            .link(&ctx)
            .await
            .expect_err("must fail");
        assert!(matches!(err, FlowError::InvalidTopology(_)));
    }

    #[tokio::test]
    async fn linking_an_unbuilt_layer_is_invalid() {
        let cluster = test_cluster();
        let (notice, _rx) = mpsc::channel(16);
        let config = EngineConfig::default();
        let hub = Arc::new(OutputHub::new());

        let from = built_layer(&cluster, &notice, &config, 1, "ScanLayer", 1).await;
        let mut layers = HashMap::new();
        let from_ref = from.layer_ref();
        layers.insert(from_ref.clone(), from);

        let ctx = LinkContext {
            layers: &layers,
            hub: &hub,
            config: &config,
        };
        let missing = LayerRef::new(OperatorId(9), "GhostLayer");
        let err = RoundRobinLink::new(from_ref, missing, 4)
            .link(&ctx)
            .await
            .expect_err("must fail");
        assert!(matches!(err, FlowError::InvalidTopology(_)));
    }

    #[tokio::test]
    async fn pairing_prefers_matching_locations() {
        let cluster = test_cluster(); // round-robin placement over n0, n1
        let (notice, _rx) = mpsc::channel(16);
        let config = EngineConfig::default();

        let from = built_layer(&cluster, &notice, &config, 1, "ScanLayer", 2).await;
        let to = built_layer(&cluster, &notice, &config, 2, "MapLayer", 2).await;

        let pairs = pair_by_location(from.workers(), to.workers());
        assert_eq!(pairs.len(), 2);
        for (source, dest) in pairs {
            assert_eq!(source.location(), dest.location());
        }
    }
}
