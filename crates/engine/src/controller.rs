//! Controller: single-owner command loop driving one workflow's topology.
//!
//! Responsibilities:
//! - build every operator's layers, then every link, in dependency order;
//! - attach terminal observer links for end operators;
//! - expose start/pause/resume/deactivate and the breakpoint lifecycle;
//! - track per-worker states and fold breakpoint reports.
//!
//! All global-breakpoint and worker-state mutation happens inside the
//! command loop: one writer, guarded by message passing instead of locks.

use std::collections::HashMap;
use std::sync::Arc;

use flowmesh_cluster::{Cluster, UnitHandle};
use flowmesh_common::metrics::global_metrics;
use flowmesh_common::{
    EngineConfig, FlowError, Location, OperatorId, Result, UnitId, WorkflowId,
};
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::breakpoint::{GlobalBreakpoint, LocalBreakpointState, PartitionOutcome};
use crate::layer::{BuildContext, LayerRef, WorkerLayer};
use crate::link::{
    AllToOneLink, HashShuffleLink, LinkContext, LinkStrategy, ObserverLink, OneToOneLink,
    RoundRobinLink,
};
use crate::operator::InputRouting;
use crate::output::OutputHub;
use crate::worker::{ControlEvent, WorkerEvent, WorkerNotice};
use crate::workflow::Workflow;

/// Workflow lifecycle states tracked by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    /// Created but topology not yet built.
    Uninitialized,
    /// Topology built and linked; producers not yet started.
    Built,
    /// Producers started; data is flowing.
    Running,
    /// Start-layer workers are paused; downstream drains through backpressure.
    Paused,
    /// Terminal: all workers torn down and cluster resources released.
    Deactivated,
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Built => "built",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Deactivated => "deactivated",
        };
        write!(f, "{s}")
    }
}

/// Worker lifecycle states tracked by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Event loop live and accepting input.
    Running,
    /// Paused by the controller or by its own triggered breakpoint.
    Paused,
    /// Stream fully processed; end-of-stream sent downstream.
    Completed,
}

/// Public workflow status snapshot returned by the control surface.
#[derive(Debug, Clone)]
pub struct WorkflowStatus {
    /// Stable workflow identifier.
    pub workflow_id: WorkflowId,
    /// Current workflow state.
    pub state: WorkflowState,
    /// Total worker units across all layers.
    pub total_workers: usize,
    /// Workers currently running.
    pub running_workers: usize,
    /// Workers currently paused.
    pub paused_workers: usize,
    /// Workers that completed their stream.
    pub completed_workers: usize,
    /// Terminal senders publishing to the output channel; the consumer is
    /// done after this many end-of-stream flags.
    pub terminal_senders: usize,
    /// Human-readable summaries of registered breakpoints.
    pub breakpoints: Vec<String>,
}

enum Command {
    Start {
        ack: oneshot::Sender<Result<()>>,
    },
    Pause {
        ack: oneshot::Sender<Result<()>>,
    },
    Resume {
        ack: oneshot::Sender<Result<()>>,
    },
    AssignBreakpoint {
        operator: OperatorId,
        breakpoint: GlobalBreakpoint,
        ack: oneshot::Sender<Result<()>>,
    },
    CollectBreakpoint {
        id: String,
        ack: oneshot::Sender<Result<String>>,
    },
    RemoveBreakpoint {
        id: String,
        ack: oneshot::Sender<Result<()>>,
    },
    Status {
        ack: oneshot::Sender<WorkflowStatus>,
    },
    Deactivate {
        ack: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable async API over the controller's command queue.
#[derive(Clone, Debug)]
pub struct ControllerHandle {
    workflow: WorkflowId,
    tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| FlowError::Cluster("controller command queue closed".to_string()))?;
        rx.await
            .map_err(|_| FlowError::Cluster("controller stopped before replying".to_string()))
    }

    /// Begin execution: start-layer producers begin pulling input.
    pub async fn start(&self) -> Result<()> {
        self.request(|ack| Command::Start { ack }).await?
    }

    /// Signal start-layer workers to stop pulling new input; downstream
    /// pauses implicitly through backpressure.
    pub async fn pause(&self) -> Result<()> {
        self.request(|ack| Command::Pause { ack }).await?
    }

    /// Re-signal paused workers in parallel; breakpoints whose report round
    /// completed are re-partitioned over the surviving workers.
    pub async fn resume(&self) -> Result<()> {
        self.request(|ack| Command::Resume { ack }).await?
    }

    /// Partition a global breakpoint over the operator's workers.
    pub async fn assign_breakpoint(
        &self,
        operator: OperatorId,
        breakpoint: GlobalBreakpoint,
    ) -> Result<()> {
        self.request(|ack| Command::AssignBreakpoint {
            operator,
            breakpoint,
            ack,
        })
        .await?
    }

    /// Pull current local state from every unreported worker and fold it in;
    /// returns the aggregate report.
    pub async fn collect_breakpoint(&self, id: &str) -> Result<String> {
        let id = id.to_string();
        self.request(|ack| Command::CollectBreakpoint { id, ack }).await?
    }

    /// Broadcast removal to every assigned worker and retire the breakpoint.
    pub async fn remove_breakpoint(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|ack| Command::RemoveBreakpoint { id, ack }).await?
    }

    pub async fn status(&self) -> Result<WorkflowStatus> {
        self.request(|ack| Command::Status { ack }).await
    }

    /// Tear down every worker in parallel and release cluster resources.
    pub async fn deactivate(&self) -> Result<()> {
        self.request(|ack| Command::Deactivate { ack }).await?
    }
}

/// Owns one workflow's operator set, built topology, worker states, and
/// global breakpoints.
pub struct Controller {
    workflow: Workflow,
    cluster: Arc<Cluster<WorkerEvent>>,
    hub: Arc<OutputHub>,
    config: EngineConfig,
    client_location: Location,
    checkpoint: bool,
    state: WorkflowState,
    layers: HashMap<LayerRef, WorkerLayer>,
    layer_order: HashMap<OperatorId, Vec<LayerRef>>,
    worker_handles: HashMap<UnitId, UnitHandle<WorkerEvent>>,
    worker_states: HashMap<UnitId, WorkerState>,
    breakpoints: HashMap<String, (OperatorId, GlobalBreakpoint)>,
    terminal_senders: usize,
    notice_tx: mpsc::Sender<WorkerNotice>,
}

impl Controller {
    /// Build the workflow topology and spawn the command loop.
    ///
    /// Construction failures (invalid topology, activation errors) abort
    /// init and propagate to the caller.
    pub async fn init(
        workflow: Workflow,
        cluster: Arc<Cluster<WorkerEvent>>,
        hub: Arc<OutputHub>,
        config: EngineConfig,
        client_location: Location,
        checkpoint: bool,
    ) -> Result<ControllerHandle> {
        let (notice_tx, notice_rx) = mpsc::channel(1024);
        let mut controller = Controller {
            workflow,
            cluster,
            hub,
            config,
            client_location,
            checkpoint,
            state: WorkflowState::Uninitialized,
            layers: HashMap::new(),
            layer_order: HashMap::new(),
            worker_handles: HashMap::new(),
            worker_states: HashMap::new(),
            breakpoints: HashMap::new(),
            terminal_senders: 0,
            notice_tx,
        };
        controller.build().await?;

        let workflow_id = controller.workflow.id();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        tokio::spawn(controller.run(cmd_rx, notice_rx));
        Ok(ControllerHandle {
            workflow: workflow_id,
            tx: cmd_tx,
        })
    }

    async fn build(&mut self) -> Result<()> {
        let order = self.workflow.topo_order()?;
        let mut intra_links: Vec<Box<dyn LinkStrategy>> = Vec::new();

        for op_id in &order {
            let op = self
                .workflow
                .operator(*op_id)
                .cloned()
                .ok_or_else(|| FlowError::InvalidTopology(format!("unknown operator {op_id}")))?;
            let topology = op.generate_topology()?;

            let mut refs = Vec::with_capacity(topology.layers.len());
            for builder in &topology.layers {
                let ctx = BuildContext {
                    cluster: &self.cluster,
                    workflow: self.workflow.id(),
                    operator: *op_id,
                    client_location: self.client_location.clone(),
                    notice: self.notice_tx.clone(),
                    config: &self.config,
                };
                let layer = builder.build(&ctx).await?;
                for handle in layer.workers() {
                    self.worker_handles
                        .insert(handle.identity().clone(), handle.clone());
                    self.worker_states
                        .insert(handle.identity().clone(), WorkerState::Running);
                }
                refs.push(layer.layer_ref());
                self.layers.insert(layer.layer_ref(), layer);
            }
            self.layer_order.insert(*op_id, refs);
            intra_links.extend(topology.links);
        }

        // Layers exist cluster-wide now; wire intra-operator links first,
        // then the workflow edges, then the terminal observers.
        let link_ctx = LinkContext {
            layers: &self.layers,
            hub: &self.hub,
            config: &self.config,
        };
        for link in &intra_links {
            link.link(&link_ctx).await?;
        }

        for (from_op, to_op) in self.workflow.edges() {
            let from = self.exit_layer(*from_op)?;
            let to = self.entry_layer(*to_op)?;
            let downstream = self
                .workflow
                .operator(*to_op)
                .ok_or_else(|| FlowError::InvalidTopology(format!("unknown operator {to_op}")))?;
            let link: Box<dyn LinkStrategy> = match downstream.input_routing(from_op) {
                InputRouting::OneToOne => {
                    Box::new(OneToOneLink::new(from, to, self.config.batch_size))
                }
                InputRouting::RoundRobin => {
                    Box::new(RoundRobinLink::new(from, to, self.config.batch_size))
                }
                InputRouting::AllToOne => {
                    Box::new(AllToOneLink::new(from, to, self.config.batch_size))
                }
                InputRouting::HashShuffle(key) => {
                    Box::new(HashShuffleLink::new(from, to, self.config.batch_size, key))
                }
            };
            link.link(&link_ctx).await?;
        }

        for end_op in self.workflow.end_operators() {
            let exit = self.exit_layer(end_op)?;
            self.terminal_senders += self
                .layers
                .get(&exit)
                .map(WorkerLayer::len)
                .unwrap_or(0);
            ObserverLink::new(exit, self.config.batch_size)
                .link(&link_ctx)
                .await?;
        }

        self.state = WorkflowState::Built;
        info!(
            workflow_id = %self.workflow.id(),
            operators = self.workflow.operators().len(),
            workers = self.worker_handles.len(),
            terminal_senders = self.terminal_senders,
            "workflow topology built"
        );
        Ok(())
    }

    fn entry_layer(&self, op: OperatorId) -> Result<LayerRef> {
        self.layer_order
            .get(&op)
            .and_then(|refs| refs.first())
            .cloned()
            .ok_or_else(|| FlowError::InvalidTopology(format!("operator {op} has no layers")))
    }

    fn exit_layer(&self, op: OperatorId) -> Result<LayerRef> {
        self.layer_order
            .get(&op)
            .and_then(|refs| refs.last())
            .cloned()
            .ok_or_else(|| FlowError::InvalidTopology(format!("operator {op} has no layers")))
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut notice_rx: mpsc::Receiver<WorkerNotice>,
    ) {
        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    let deactivate = matches!(cmd, Command::Deactivate { .. });
                    self.handle_command(cmd).await;
                    if deactivate {
                        break;
                    }
                }
                Some(notice) = notice_rx.recv() => self.handle_notice(notice).await,
                else => break,
            }
        }
        debug!(workflow_id = %self.workflow.id(), "controller loop stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { ack } => {
                let _ = ack.send(self.start().await);
            }
            Command::Pause { ack } => {
                let _ = ack.send(self.pause().await);
            }
            Command::Resume { ack } => {
                let _ = ack.send(self.resume().await);
            }
            Command::AssignBreakpoint {
                operator,
                breakpoint,
                ack,
            } => {
                let _ = ack.send(self.assign_breakpoint(operator, breakpoint).await);
            }
            Command::CollectBreakpoint { id, ack } => {
                let _ = ack.send(self.collect_breakpoint(&id).await);
            }
            Command::RemoveBreakpoint { id, ack } => {
                let _ = ack.send(self.remove_breakpoint(&id).await);
            }
            Command::Status { ack } => {
                let _ = ack.send(self.status());
            }
            Command::Deactivate { ack } => {
                let _ = ack.send(self.deactivate().await);
            }
        }
    }

    async fn handle_notice(&mut self, notice: WorkerNotice) {
        match notice {
            WorkerNotice::Completed { worker } => {
                self.worker_states.insert(worker, WorkerState::Completed);
            }
            WorkerNotice::BreakpointTriggered { worker, state } => {
                self.worker_states.insert(worker.clone(), WorkerState::Paused);
                self.fold_report(&worker, &state);
            }
        }
    }

    fn fold_report(&mut self, worker: &UnitId, state: &LocalBreakpointState) {
        let workflow_label = self.workflow.id().to_string();
        match self.breakpoints.get_mut(&state.id) {
            Some((_, bp)) => {
                let accepted = bp.accept(worker, state);
                global_metrics().record_breakpoint_report(&workflow_label, accepted);
                if !accepted {
                    warn!(worker = %worker, breakpoint = %state.id, version = state.version, "stale or duplicate breakpoint report rejected");
                } else if bp.is_triggered() {
                    info!(workflow_id = %workflow_label, report = %bp.report(), "global breakpoint triggered");
                }
            }
            None => {
                warn!(worker = %worker, breakpoint = %state.id, "report for unknown breakpoint ignored");
            }
        }
    }

    fn start_workers(&self) -> Vec<UnitHandle<WorkerEvent>> {
        self.workflow
            .start_operators()
            .into_iter()
            .flat_map(|op| self.layer_order.get(&op).cloned().unwrap_or_default())
            .filter_map(|layer_ref| self.layers.get(&layer_ref))
            .flat_map(|layer| layer.workers().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    async fn start(&mut self) -> Result<()> {
        if !matches!(self.state, WorkflowState::Built) {
            return Err(FlowError::Execution(format!(
                "cannot start workflow in state {}",
                self.state
            )));
        }
        for handle in self.start_workers() {
            handle
                .deliver(WorkerEvent::Control(ControlEvent::Start))
                .await?;
        }
        self.state = WorkflowState::Running;
        info!(workflow_id = %self.workflow.id(), "workflow started");
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        if !matches!(self.state, WorkflowState::Running) {
            return Err(FlowError::Execution(format!(
                "cannot pause workflow in state {}",
                self.state
            )));
        }
        let targets = self.start_workers();
        let mut acks = Vec::with_capacity(targets.len());
        for handle in &targets {
            let (tx, rx) = oneshot::channel();
            if handle
                .deliver(WorkerEvent::Control(ControlEvent::Pause { ack: tx }))
                .await
                .is_ok()
            {
                acks.push(rx);
            }
        }
        join_all(acks).await;
        for handle in &targets {
            let state = self
                .worker_states
                .entry(handle.identity().clone())
                .or_insert(WorkerState::Running);
            if *state != WorkerState::Completed {
                *state = WorkerState::Paused;
            }
        }
        self.state = WorkflowState::Paused;
        info!(workflow_id = %self.workflow.id(), "workflow paused");

        if self.checkpoint {
            // Checkpoint mode: bring every breakpoint aggregate current at
            // the pause point.
            let ids: Vec<String> = self.breakpoints.keys().cloned().collect();
            for id in ids {
                if let Err(e) = self.collect_breakpoint(&id).await {
                    warn!(breakpoint = %id, error = %e, "checkpoint collect failed");
                }
            }
        }
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        if !matches!(self.state, WorkflowState::Paused) {
            return Err(FlowError::Execution(format!(
                "cannot resume workflow in state {}",
                self.state
            )));
        }

        // Re-partition any breakpoint whose report round completed, over the
        // workers that survived the pause cycle.
        let ids: Vec<String> = self
            .breakpoints
            .iter()
            .filter(|(_, (_, bp))| bp.is_repartition_required() && !bp.is_completed())
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some((op_id, mut bp)) = self.breakpoints.remove(&id) {
                let candidates = self.breakpoint_candidates(op_id);
                let outcome = bp.partition(&candidates);
                info!(breakpoint = %id, version = bp.version(), workers = outcome.assignments.len(), "breakpoint re-partitioned");
                self.dispatch_partition(&id, outcome).await;
                self.breakpoints.insert(id, (op_id, bp));
            }
        }

        // Resume start-layer workers plus anything paused by a breakpoint.
        let mut targets: Vec<UnitHandle<WorkerEvent>> = self.start_workers();
        for (worker, state) in &self.worker_states {
            if *state == WorkerState::Paused {
                if let Some(handle) = self.worker_handles.get(worker) {
                    if !targets.iter().any(|t| t.identity() == worker) {
                        targets.push(handle.clone());
                    }
                }
            }
        }

        let mut acks = Vec::with_capacity(targets.len());
        for handle in &targets {
            let (tx, rx) = oneshot::channel();
            if handle
                .deliver(WorkerEvent::Control(ControlEvent::Resume { ack: tx }))
                .await
                .is_ok()
            {
                acks.push(rx);
            }
        }
        join_all(acks).await;
        for handle in &targets {
            let state = self
                .worker_states
                .entry(handle.identity().clone())
                .or_insert(WorkerState::Running);
            if *state != WorkerState::Completed {
                *state = WorkerState::Running;
            }
        }
        self.state = WorkflowState::Running;
        info!(workflow_id = %self.workflow.id(), "workflow resumed");
        Ok(())
    }

    fn breakpoint_candidates(&self, op_id: OperatorId) -> Vec<UnitId> {
        let Some(op) = self.workflow.operator(op_id) else {
            return Vec::new();
        };
        let refs = self.layer_order.get(&op_id).cloned().unwrap_or_default();
        let layers: Vec<&WorkerLayer> = refs.iter().filter_map(|r| self.layers.get(r)).collect();
        op.breakpoint_workers(&layers, &self.worker_states)
    }

    async fn assign_breakpoint(
        &mut self,
        operator: OperatorId,
        mut breakpoint: GlobalBreakpoint,
    ) -> Result<()> {
        if self.workflow.operator(operator).is_none() {
            return Err(FlowError::InvalidConfig(format!(
                "unknown operator {operator} for breakpoint '{}'",
                breakpoint.id()
            )));
        }
        let candidates = self.breakpoint_candidates(operator);
        if candidates.is_empty() {
            return Err(FlowError::Execution(format!(
                "no running workers to assign breakpoint '{}'",
                breakpoint.id()
            )));
        }
        let id = breakpoint.id().to_string();
        let outcome = breakpoint.partition(&candidates);
        info!(breakpoint = %id, version = breakpoint.version(), workers = outcome.assignments.len(), "breakpoint partitioned");
        self.dispatch_partition(&id, outcome).await;
        self.breakpoints.insert(id, (operator, breakpoint));
        Ok(())
    }

    async fn dispatch_partition(&self, id: &str, outcome: PartitionOutcome) {
        for worker in &outcome.removed {
            if let Some(handle) = self.worker_handles.get(worker) {
                let (tx, rx) = oneshot::channel();
                let event = WorkerEvent::Control(ControlEvent::RemoveBreakpoint {
                    id: id.to_string(),
                    ack: tx,
                });
                if handle.deliver(event).await.is_ok() {
                    let _ = rx.await;
                }
            }
        }
        for (worker, local) in outcome.assignments {
            match self.worker_handles.get(&worker) {
                Some(handle) => {
                    let (tx, rx) = oneshot::channel();
                    let event = WorkerEvent::Control(ControlEvent::AssignBreakpoint {
                        breakpoint: local,
                        ack: tx,
                    });
                    if handle.deliver(event).await.is_ok() {
                        let _ = rx.await;
                    }
                }
                None => {
                    warn!(worker = %worker, breakpoint = id, "breakpoint target has no handle");
                }
            }
        }
    }

    async fn collect_breakpoint(&mut self, id: &str) -> Result<String> {
        let Some((op_id, mut bp)) = self.breakpoints.remove(id) else {
            return Err(FlowError::InvalidConfig(format!(
                "unknown breakpoint '{id}'"
            )));
        };

        // Assume-reliable pull, no retry or timeout: a known simplification
        // of the collect round-trip.
        let pending: Vec<UnitId> = bp.un_reported_workers().iter().cloned().collect();
        for worker in pending {
            let Some(handle) = self.worker_handles.get(&worker) else {
                continue;
            };
            let (tx, rx) = oneshot::channel();
            let event = WorkerEvent::Control(ControlEvent::QueryBreakpoint {
                id: id.to_string(),
                reply: tx,
            });
            if handle.deliver(event).await.is_err() {
                continue;
            }
            if let Ok(Some(state)) = rx.await {
                bp.accept(&worker, &state);
            }
        }
        bp.clear_un_reported();

        let report = bp.report();
        self.breakpoints.insert(id.to_string(), (op_id, bp));
        Ok(report)
    }

    async fn remove_breakpoint(&mut self, id: &str) -> Result<()> {
        let Some((_, bp)) = self.breakpoints.remove(id) else {
            return Err(FlowError::InvalidConfig(format!(
                "unknown breakpoint '{id}'"
            )));
        };
        for worker in bp.all_workers() {
            if let Some(handle) = self.worker_handles.get(worker) {
                let (tx, rx) = oneshot::channel();
                let event = WorkerEvent::Control(ControlEvent::RemoveBreakpoint {
                    id: id.to_string(),
                    ack: tx,
                });
                if handle.deliver(event).await.is_ok() {
                    let _ = rx.await;
                }
            }
        }
        info!(breakpoint = id, "breakpoint removed");
        Ok(())
    }

    fn status(&self) -> WorkflowStatus {
        let mut running = 0;
        let mut paused = 0;
        let mut completed = 0;
        for state in self.worker_states.values() {
            match state {
                WorkerState::Running => running += 1,
                WorkerState::Paused => paused += 1,
                WorkerState::Completed => completed += 1,
            }
        }
        WorkflowStatus {
            workflow_id: self.workflow.id(),
            state: self.state,
            total_workers: self.worker_states.len(),
            running_workers: running,
            paused_workers: paused,
            completed_workers: completed,
            terminal_senders: self.terminal_senders,
            breakpoints: self
                .breakpoints
                .values()
                .map(|(_, bp)| bp.report())
                .collect(),
        }
    }

    async fn deactivate(&mut self) -> Result<()> {
        if matches!(self.state, WorkflowState::Deactivated) {
            return Ok(());
        }
        let handles: Vec<UnitHandle<WorkerEvent>> =
            self.worker_handles.values().cloned().collect();
        let mut acks = Vec::with_capacity(handles.len());
        for handle in &handles {
            let (tx, rx) = oneshot::channel();
            if handle
                .deliver(WorkerEvent::Control(ControlEvent::Deactivate { ack: tx }))
                .await
                .is_ok()
            {
                acks.push(rx);
            }
        }
        join_all(acks).await;
        for handle in &handles {
            self.cluster.deactivate(handle.identity());
        }
        self.hub.unregister(self.workflow.id());
        self.worker_handles.clear();
        self.state = WorkflowState::Deactivated;
        info!(workflow_id = %self.workflow.id(), workers = handles.len(), "workflow deactivated");
        Ok(())
    }
}
