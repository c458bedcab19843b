//! flowmesh execution engine.
//!
//! Architecture role:
//! - compiles operator descriptors into parallel worker layers on the cluster
//! - wires layers with routing send strategies (one-to-one, round-robin,
//!   all-to-one, hash-shuffle, observer)
//! - drives execution with pause/resume and breakpoint partition/collection
//!
//! Key modules:
//! - [`tuple`] / [`processor`]: the data unit and the pluggable operator contract
//! - [`ordering`] / [`sending`] / [`send`]: delivery, retry, and routing
//! - [`layer`] / [`link`] / [`operator`] / [`workflow`]: topology compilation
//! - [`breakpoint`] / [`controller`]: coordination and lifecycle

pub mod breakpoint;
pub mod controller;
pub mod layer;
pub mod link;
pub mod operator;
pub mod ordering;
pub mod output;
pub mod processor;
pub mod routing;
pub mod send;
pub mod sending;
pub mod tuple;
pub mod worker;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_util;

pub use breakpoint::{
    GlobalBreakpoint, LocalBreakpoint, LocalBreakpointKind, LocalBreakpointState, PartitionOutcome,
};
pub use controller::{Controller, ControllerHandle, WorkerState, WorkflowState, WorkflowStatus};
pub use layer::{DeployArgs, LayerRef, ProcessorWorkerLayer, ProducerWorkerLayer, WorkerLayer};
pub use link::{
    AllToOneLink, HashShuffleLink, LinkContext, LinkStrategy, ObserverLink, OneToOneLink,
    RoundRobinLink,
};
pub use operator::{InputRouting, LayerBuilder, Operator, Topology};
pub use ordering::OrderingEnforcer;
pub use output::OutputHub;
pub use processor::{ProcessorFactory, ProducerFactory, TupleProcessor, TupleProducer};
pub use routing::{
    deregister_routing_extractor, get_routing_extractor, register_routing_extractor,
    RoutingExtractor, RoutingKey,
};
pub use send::{
    AllToOneSend, HashShuffleSend, ObserverSend, OneToOneSend, RoundRobinSend, SendStrategy,
};
pub use sending::{RetryPolicy, SendOutcome, SendingUnit};
pub use tuple::{PayloadMessage, Tuple};
pub use worker::{ControlEvent, ProcessorWorker, ProducerWorker, WorkerEvent, WorkerNotice};
pub use workflow::Workflow;
