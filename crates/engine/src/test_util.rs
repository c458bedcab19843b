//! Shared fixtures for in-crate tests.

use std::sync::Arc;

use flowmesh_cluster::{Cluster, PlacementHint, UnitHandle};
use flowmesh_common::{Location, OperatorId, UnitId, WorkflowId};
use tokio::sync::{mpsc, oneshot};

use crate::send::SendStrategy;
use crate::tuple::PayloadMessage;
use crate::worker::{ControlEvent, WorkerEvent};

pub(crate) fn test_cluster() -> Arc<Cluster<WorkerEvent>> {
    Arc::new(Cluster::new(vec![
        Location::new("n0"),
        Location::new("n1"),
    ]))
}

pub(crate) fn unit_id(name: &str) -> UnitId {
    UnitId::new(WorkflowId(1), OperatorId(1), name)
}

/// Activate a unit that forwards every inbound payload to a probe channel.
pub(crate) async fn spawn_probe(
    cluster: &Cluster<WorkerEvent>,
    name: &str,
) -> (UnitHandle<WorkerEvent>, mpsc::Receiver<PayloadMessage>) {
    let (tx, rx) = mpsc::channel(256);
    let handle = cluster
        .activate(unit_id(name), &PlacementHint::default(), move |_ctx, mut mailbox| {
            async move {
                while let Some(event) = mailbox.recv().await {
                    if let WorkerEvent::Payload(msg) = event {
                        let _ = tx.send(msg).await;
                    }
                }
            }
        })
        .await
        .expect("activate probe");
    (handle, rx)
}

pub(crate) async fn install_strategy(
    handle: &UnitHandle<WorkerEvent>,
    strategy: Box<dyn SendStrategy>,
) {
    let (tx, rx) = oneshot::channel();
    handle
        .deliver(WorkerEvent::Control(ControlEvent::InstallSendStrategy {
            strategy,
            ack: tx,
        }))
        .await
        .expect("deliver install");
    rx.await.expect("install ack");
}

pub(crate) async fn expect_upstream(handle: &UnitHandle<WorkerEvent>, count: usize) {
    let (tx, rx) = oneshot::channel();
    handle
        .deliver(WorkerEvent::Control(ControlEvent::AddExpectedUpstream {
            count,
            ack: tx,
        }))
        .await
        .expect("deliver expectation");
    rx.await.expect("expectation ack");
}
