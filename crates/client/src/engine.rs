//! Engine facade wiring cluster, output hub, and workflow controllers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};

use flowmesh_cluster::Cluster;
use flowmesh_common::{EngineConfig, FlowError, Location, Result, WorkflowId};
use flowmesh_engine::controller::{Controller, ControllerHandle, WorkflowStatus};
use flowmesh_engine::output::OutputHub;
use flowmesh_engine::tuple::PayloadMessage;
use flowmesh_engine::worker::WorkerEvent;
use flowmesh_engine::workflow::Workflow;
use tokio::sync::mpsc;
use tracing::info;

/// Opt-in tracing initialization for binaries and tests; honors `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();
    });
}

/// Hosting-application entry point: one engine per cluster, many workflows.
pub struct FlowEngine {
    cluster: Arc<Cluster<WorkerEvent>>,
    hub: Arc<OutputHub>,
    config: EngineConfig,
    client_location: Location,
    controllers: Mutex<HashMap<WorkflowId, ControllerHandle>>,
}

impl FlowEngine {
    /// Engine over the given worker nodes, with default configuration.
    ///
    /// The originating client is modeled as its own location so placement
    /// hints can keep workers off it.
    pub fn new(nodes: Vec<Location>) -> Self {
        Self {
            cluster: Arc::new(Cluster::new(nodes)),
            hub: Arc::new(OutputHub::new()),
            config: EngineConfig::default(),
            client_location: Location::new("client"),
            controllers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_client_location(mut self, location: Location) -> Self {
        self.client_location = location;
        self
    }

    pub fn cluster(&self) -> &Arc<Cluster<WorkerEvent>> {
        &self.cluster
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create the output stream for a workflow. Call before `init` so the
    /// terminal observer links find the channel.
    ///
    /// The stream carries one `end_of_stream` message per terminal sender;
    /// consumers count expected end flags (`WorkflowStatus::terminal_senders`)
    /// to know when the workflow is done.
    pub fn register_output(&self, workflow: WorkflowId) -> mpsc::Receiver<PayloadMessage> {
        self.hub.register(workflow, self.config.output_capacity)
    }

    /// Build a workflow's topology and register its controller.
    ///
    /// With `checkpoint` set, every pause also collects all registered
    /// breakpoints so their aggregates are current at the pause point.
    pub async fn init(&self, workflow: Workflow, checkpoint: bool) -> Result<ControllerHandle> {
        let workflow_id = workflow.id();
        let handle = Controller::init(
            workflow,
            Arc::clone(&self.cluster),
            Arc::clone(&self.hub),
            self.config.clone(),
            self.client_location.clone(),
            checkpoint,
        )
        .await?;
        self.controllers
            .lock()
            .expect("controller registry lock poisoned")
            .insert(workflow_id, handle.clone());
        info!(workflow_id = %workflow_id, checkpoint, "workflow initialized");
        Ok(handle)
    }

    fn controller(&self, workflow: WorkflowId) -> Result<ControllerHandle> {
        self.controllers
            .lock()
            .expect("controller registry lock poisoned")
            .get(&workflow)
            .cloned()
            .ok_or_else(|| {
                FlowError::InvalidConfig(format!("workflow {workflow} is not initialized"))
            })
    }

    pub async fn start(&self, workflow: WorkflowId) -> Result<()> {
        self.controller(workflow)?.start().await
    }

    pub async fn pause(&self, workflow: WorkflowId) -> Result<()> {
        self.controller(workflow)?.pause().await
    }

    pub async fn resume(&self, workflow: WorkflowId) -> Result<()> {
        self.controller(workflow)?.resume().await
    }

    pub async fn status(&self, workflow: WorkflowId) -> Result<WorkflowStatus> {
        self.controller(workflow)?.status().await
    }

    /// Tear the workflow down and forget its controller.
    pub async fn deactivate(&self, workflow: WorkflowId) -> Result<()> {
        let handle = self.controller(workflow)?;
        handle.deactivate().await?;
        self.controllers
            .lock()
            .expect("controller registry lock poisoned")
            .remove(&workflow);
        Ok(())
    }
}
