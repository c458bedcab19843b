//! Location-transparent addressable unit runtime.
//!
//! Architecture role:
//! - activates one mailbox-driven task per unit identity, at most once
//! - delegates node selection to a pluggable [`PlacementPolicy`]
//! - hands out cloneable [`UnitHandle`]s addressable from anywhere in-process
//!
//! The engine only relies on "one logical instance per identity, reachable by
//! identity"; everything else (mailbox capacity, backpressure signal) is a
//! property of this runtime, not of the engine.

pub mod placement;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use flowmesh_common::{FlowError, Location, Result, UnitId};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

pub use placement::{PlacementHint, PlacementPolicy, RoundRobinPlacement};

/// Cloneable address of one activated unit.
pub struct UnitHandle<M> {
    identity: UnitId,
    location: Location,
    tx: mpsc::Sender<M>,
    backpressure: watch::Receiver<bool>,
}

impl<M> Clone for UnitHandle<M> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            location: self.location.clone(),
            tx: self.tx.clone(),
            backpressure: self.backpressure.clone(),
        }
    }
}

impl<M> fmt::Debug for UnitHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitHandle")
            .field("identity", &self.identity)
            .field("location", &self.location)
            .finish()
    }
}

impl<M: Send + 'static> UnitHandle<M> {
    pub fn identity(&self) -> &UnitId {
        &self.identity
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Deliver a message, waiting for mailbox capacity (assume-reliable path
    /// used for control traffic).
    pub async fn deliver(&self, msg: M) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| FlowError::Cluster(format!("unit {} mailbox closed", self.identity)))
    }

    /// One bounded delivery attempt. On failure the message is handed back so
    /// the caller can retry or drop it.
    pub async fn try_deliver(&self, msg: M, timeout: Duration) -> std::result::Result<(), M> {
        match self.tx.send_timeout(msg, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(m)) | Err(SendTimeoutError::Closed(m)) => Err(m),
        }
    }

    /// Current cooperative-backpressure flag raised by the unit itself.
    pub fn is_backpressured(&self) -> bool {
        *self.backpressure.borrow()
    }

    /// Watch endpoint for flow-controlled senders.
    pub fn backpressure_watch(&self) -> watch::Receiver<bool> {
        self.backpressure.clone()
    }
}

/// Identity/location context handed to a unit body at activation.
pub struct UnitContext {
    identity: UnitId,
    location: Location,
    backpressure: watch::Sender<bool>,
}

impl UnitContext {
    pub fn identity(&self) -> &UnitId {
        &self.identity
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Raise or clear this unit's cooperative-backpressure flag.
    pub fn set_backpressure(&self, on: bool) {
        let _ = self.backpressure.send(on);
    }
}

struct ActiveUnit<M> {
    handle: UnitHandle<M>,
    task: JoinHandle<()>,
}

/// In-process cluster of addressable units, generic over the mailbox message
/// type.
pub struct Cluster<M> {
    nodes: Vec<Location>,
    policy: Box<dyn PlacementPolicy>,
    mailbox_capacity: usize,
    units: Mutex<HashMap<UnitId, ActiveUnit<M>>>,
}

impl<M> fmt::Debug for Cluster<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.nodes)
            .field("mailbox_capacity", &self.mailbox_capacity)
            .finish()
    }
}

impl<M: Send + 'static> Cluster<M> {
    pub fn new(nodes: Vec<Location>) -> Self {
        Self::with_placement_policy(nodes, Box::new(RoundRobinPlacement::new()))
    }

    pub fn with_placement_policy(nodes: Vec<Location>, policy: Box<dyn PlacementPolicy>) -> Self {
        Self {
            nodes,
            policy,
            mailbox_capacity: 1024,
            units: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }

    /// Activate the unit addressed by `identity`, spawning `body` on a node
    /// chosen by the placement policy.
    ///
    /// At most one activation per identity: re-activating returns the existing
    /// handle and never runs `body` a second time.
    pub async fn activate<F, Fut>(
        &self,
        identity: UnitId,
        hint: &PlacementHint,
        body: F,
    ) -> Result<UnitHandle<M>>
    where
        F: FnOnce(UnitContext, mpsc::Receiver<M>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.nodes.is_empty() {
            return Err(FlowError::Cluster("cluster has no nodes".to_string()));
        }
        {
            let units = self.units.lock().expect("unit registry lock poisoned");
            if let Some(existing) = units.get(&identity) {
                return Ok(existing.handle.clone());
            }
        }

        let location = self.policy.place(&identity, hint, &self.nodes);
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        let (bp_tx, bp_rx) = watch::channel(false);
        let ctx = UnitContext {
            identity: identity.clone(),
            location: location.clone(),
            backpressure: bp_tx,
        };
        let handle = UnitHandle {
            identity: identity.clone(),
            location: location.clone(),
            tx,
            backpressure: bp_rx,
        };
        debug!(unit = %identity, location = %location, "unit activated");

        let task = tokio::spawn(body(ctx, rx));
        let mut units = self.units.lock().expect("unit registry lock poisoned");
        // Two concurrent first activations race benignly: the loser's task is
        // aborted before it is addressable.
        if let Some(existing) = units.get(&identity) {
            task.abort();
            return Ok(existing.handle.clone());
        }
        units.insert(identity, ActiveUnit { handle: handle.clone(), task });
        Ok(handle)
    }

    pub fn lookup(&self, identity: &UnitId) -> Option<UnitHandle<M>> {
        self.units
            .lock()
            .expect("unit registry lock poisoned")
            .get(identity)
            .map(|u| u.handle.clone())
    }

    pub fn location_of(&self, identity: &UnitId) -> Option<Location> {
        self.units
            .lock()
            .expect("unit registry lock poisoned")
            .get(identity)
            .map(|u| u.handle.location.clone())
    }

    /// Remove the unit and abort its task. Graceful shutdown (dispose/drain)
    /// is the caller's job, via a control message sent before this.
    pub fn deactivate(&self, identity: &UnitId) -> bool {
        let removed = self
            .units
            .lock()
            .expect("unit registry lock poisoned")
            .remove(identity);
        match removed {
            Some(unit) => {
                unit.task.abort();
                debug!(unit = %identity, "unit deactivated");
                true
            }
            None => false,
        }
    }

    pub fn identities(&self) -> Vec<UnitId> {
        self.units
            .lock()
            .expect("unit registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn nodes(&self) -> &[Location] {
        &self.nodes
    }
}
