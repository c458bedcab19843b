//! Worker layer construction: the parallel homogeneous units realizing one
//! pipeline stage of an operator.
//!
//! Build algorithm: for `i` in `[0, num_workers)`, activate a unit addressed
//! by `(workflow, operator, "{layer_id}{i}")` with a placement hint that
//! forbids collocating it with the originating client node, then group the
//! returned handles by their placement location. Identities are derived, not
//! generated, so building twice for the same operator is idempotent.

use std::collections::HashMap;

use flowmesh_cluster::{Cluster, PlacementHint, UnitHandle};
use flowmesh_common::{
    EngineConfig, FlowError, Location, OperatorId, Result, UnitId, WorkflowId,
};
use tokio::sync::mpsc;
use tracing::info;

use crate::processor::{ProcessorFactory, ProducerFactory};
use crate::worker::{ProcessorWorker, ProducerWorker, WorkerEvent, WorkerNotice};

/// Deploy-argument bag handed to every worker of a layer.
pub type DeployArgs = HashMap<String, String>;

/// Stable reference to one layer of one operator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayerRef {
    pub operator: OperatorId,
    pub layer: String,
}

impl LayerRef {
    pub fn new(operator: OperatorId, layer: impl Into<String>) -> Self {
        Self {
            operator,
            layer: layer.into(),
        }
    }
}

/// A built layer: worker handles in identity order plus the location map.
///
/// Built once (`is_built` flips at construction) and immutable afterward
/// until the workflow is torn down.
#[derive(Debug)]
pub struct WorkerLayer {
    id: String,
    operator: OperatorId,
    workflow: WorkflowId,
    workers: Vec<UnitHandle<WorkerEvent>>,
    location_map: HashMap<Location, Vec<UnitHandle<WorkerEvent>>>,
    is_built: bool,
}

impl WorkerLayer {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operator(&self) -> OperatorId {
        self.operator
    }

    pub fn workflow(&self) -> WorkflowId {
        self.workflow
    }

    /// Worker handles in identity (index) order.
    pub fn workers(&self) -> &[UnitHandle<WorkerEvent>] {
        &self.workers
    }

    pub fn worker_ids(&self) -> Vec<UnitId> {
        self.workers.iter().map(|w| w.identity().clone()).collect()
    }

    pub fn location_map(&self) -> &HashMap<Location, Vec<UnitHandle<WorkerEvent>>> {
        &self.location_map
    }

    pub fn is_built(&self) -> bool {
        self.is_built
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn layer_ref(&self) -> LayerRef {
        LayerRef::new(self.operator, self.id.clone())
    }
}

/// Shared inputs for building one operator's layers.
pub struct BuildContext<'a> {
    pub cluster: &'a Cluster<WorkerEvent>,
    pub workflow: WorkflowId,
    pub operator: OperatorId,
    pub client_location: Location,
    pub notice: mpsc::Sender<WorkerNotice>,
    pub config: &'a EngineConfig,
}

/// Layer of source-driven workers, each owning one tuple producer.
pub struct ProducerWorkerLayer {
    pub id: String,
    pub num_workers: usize,
    pub factory: ProducerFactory,
    pub deploy_args: DeployArgs,
}

impl ProducerWorkerLayer {
    pub fn new(id: impl Into<String>, num_workers: usize, factory: ProducerFactory) -> Self {
        Self {
            id: id.into(),
            num_workers,
            factory,
            deploy_args: DeployArgs::new(),
        }
    }

    pub fn with_deploy_args(mut self, deploy_args: DeployArgs) -> Self {
        self.deploy_args = deploy_args;
        self
    }

    pub(crate) async fn build(&self, ctx: &BuildContext<'_>) -> Result<WorkerLayer> {
        let pull_batch = pull_batch_override(&self.deploy_args, ctx.config)?;
        build_layer(ctx, &self.id, self.num_workers, |i| {
            let worker = ProducerWorker::new(
                (self.factory)(i),
                self.id.clone(),
                ctx.notice.clone(),
                pull_batch,
            );
            move |uctx, rx| worker.run(uctx, rx)
        })
        .await
    }
}

/// Layer of input-driven workers, each owning one tuple processor.
pub struct ProcessorWorkerLayer {
    pub id: String,
    pub num_workers: usize,
    pub factory: ProcessorFactory,
    pub deploy_args: DeployArgs,
}

impl ProcessorWorkerLayer {
    pub fn new(id: impl Into<String>, num_workers: usize, factory: ProcessorFactory) -> Self {
        Self {
            id: id.into(),
            num_workers,
            factory,
            deploy_args: DeployArgs::new(),
        }
    }

    pub fn with_deploy_args(mut self, deploy_args: DeployArgs) -> Self {
        self.deploy_args = deploy_args;
        self
    }

    pub(crate) async fn build(&self, ctx: &BuildContext<'_>) -> Result<WorkerLayer> {
        build_layer(ctx, &self.id, self.num_workers, |i| {
            let worker =
                ProcessorWorker::new((self.factory)(i), self.id.clone(), ctx.notice.clone());
            move |uctx, rx| worker.run(uctx, rx)
        })
        .await
    }
}

fn pull_batch_override(deploy_args: &DeployArgs, config: &EngineConfig) -> Result<usize> {
    match deploy_args.get("producer_pull_batch") {
        None => Ok(config.producer_pull_batch),
        Some(raw) => raw.parse::<usize>().map_err(|e| {
            FlowError::InvalidConfig(format!("invalid producer_pull_batch value '{raw}': {e}"))
        }),
    }
}

async fn build_layer<B, F, Fut>(
    ctx: &BuildContext<'_>,
    layer_id: &str,
    num_workers: usize,
    mut body: B,
) -> Result<WorkerLayer>
where
    B: FnMut(usize) -> F,
    F: FnOnce(flowmesh_cluster::UnitContext, mpsc::Receiver<WorkerEvent>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    if num_workers == 0 {
        return Err(FlowError::InvalidConfig(format!(
            "layer '{layer_id}' must have at least one worker"
        )));
    }

    let hint = PlacementHint::excluding(ctx.client_location.clone());
    let mut workers = Vec::with_capacity(num_workers);
    let mut location_map: HashMap<Location, Vec<UnitHandle<WorkerEvent>>> = HashMap::new();

    for i in 0..num_workers {
        let identity = UnitId::new(ctx.workflow, ctx.operator, format!("{layer_id}{i}"));
        let handle = ctx.cluster.activate(identity, &hint, body(i)).await?;
        location_map
            .entry(handle.location().clone())
            .or_default()
            .push(handle.clone());
        workers.push(handle);
    }

    info!(
        workflow_id = %ctx.workflow,
        operator_id = %ctx.operator,
        layer = layer_id,
        workers = num_workers,
        locations = location_map.len(),
        "worker layer built"
    );
    Ok(WorkerLayer {
        id: layer_id.to_string(),
        operator: ctx.operator,
        workflow: ctx.workflow,
        workers,
        location_map,
        is_built: true,
    })
}

#[cfg(test)]
mod tests {
    use flowmesh_common::Result as FlowResult;
    use tokio::sync::mpsc;

    use super::*;
    use crate::processor::TupleProducer;
    use crate::test_util::test_cluster;
    use crate::tuple::Tuple;

    struct EmptyProducer;

    impl TupleProducer for EmptyProducer {
        fn next_batch(&mut self, _max: usize) -> FlowResult<Option<Vec<Tuple>>> {
            Ok(None)
        }
    }

    fn builder(id: &str, n: usize) -> ProducerWorkerLayer {
        ProducerWorkerLayer::new(
            id,
            n,
            Box::new(|_| Box::new(EmptyProducer) as Box<dyn TupleProducer>),
        )
    }

    #[tokio::test]
    async fn build_is_idempotent_per_operator() {
        let cluster = test_cluster();
        let (notice, _notice_rx) = mpsc::channel(16);
        let config = EngineConfig::default();
        let ctx = BuildContext {
            cluster: &cluster,
            workflow: WorkflowId(1),
            operator: OperatorId(1),
            client_location: Location::new("client"),
            notice,
            config: &config,
        };

        let layer_builder = builder("ScanLayer", 3);
        let first = layer_builder.build(&ctx).await.expect("first build");
        let second = layer_builder.build(&ctx).await.expect("second build");

        assert!(first.is_built());
        assert_eq!(first.worker_ids(), second.worker_ids());
        assert_eq!(cluster.identities().len(), 3);
        assert_eq!(
            first.worker_ids()[0],
            UnitId::new(WorkflowId(1), OperatorId(1), "ScanLayer0")
        );
    }

    #[tokio::test]
    async fn placement_hint_keeps_workers_off_the_client_node() {
        let cluster = test_cluster(); // nodes n0, n1
        let (notice, _notice_rx) = mpsc::channel(16);
        let config = EngineConfig::default();
        let ctx = BuildContext {
            cluster: &cluster,
            workflow: WorkflowId(1),
            operator: OperatorId(1),
            client_location: Location::new("n0"),
            notice,
            config: &config,
        };

        let layer = builder("ScanLayer", 4).build(&ctx).await.expect("build");
        assert_eq!(layer.location_map().len(), 1);
        assert!(layer.location_map().contains_key(&Location::new("n1")));
    }

    #[tokio::test]
    async fn zero_worker_layer_is_invalid() {
        let cluster = test_cluster();
        let (notice, _notice_rx) = mpsc::channel(16);
        let config = EngineConfig::default();
        let ctx = BuildContext {
            cluster: &cluster,
            workflow: WorkflowId(1),
            operator: OperatorId(1),
            client_location: Location::new("client"),
            notice,
            config: &config,
        };

        let err = builder("ScanLayer", 0)
            .build(&ctx)
            .await
            .expect_err("must fail");
        assert!(matches!(err, FlowError::InvalidConfig(_)));
    }
}
