//! Workflow output boundary: per-workflow bounded channels of payload
//! messages.

use std::collections::HashMap;
use std::sync::Mutex;

use flowmesh_common::{FlowError, Result, WorkflowId};
use tokio::sync::mpsc;

use crate::tuple::PayloadMessage;

/// Publishes terminal batches onto per-workflow output channels.
///
/// One consumer per workflow: `register` creates the channel and returns the
/// receiving end. Publishing waits for capacity, which backpressures the
/// terminal workers when the consumer is slow. The stream is terminated by
/// one `end_of_stream` message per terminal sender; callers count expected
/// end flags to know when a workflow is done.
#[derive(Debug, Default)]
pub struct OutputHub {
    channels: Mutex<HashMap<WorkflowId, mpsc::Sender<PayloadMessage>>>,
}

impl OutputHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the output channel for `workflow`.
    pub fn register(
        &self,
        workflow: WorkflowId,
        capacity: usize,
    ) -> mpsc::Receiver<PayloadMessage> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.channels
            .lock()
            .expect("output hub lock poisoned")
            .insert(workflow, tx);
        rx
    }

    pub fn unregister(&self, workflow: WorkflowId) {
        self.channels
            .lock()
            .expect("output hub lock poisoned")
            .remove(&workflow);
    }

    pub async fn publish(&self, workflow: WorkflowId, msg: PayloadMessage) -> Result<()> {
        let tx = self
            .channels
            .lock()
            .expect("output hub lock poisoned")
            .get(&workflow)
            .cloned()
            .ok_or_else(|| {
                FlowError::Execution(format!("workflow {workflow} has no output channel"))
            })?;
        tx.send(msg)
            .await
            .map_err(|_| FlowError::Execution(format!("workflow {workflow} output consumer gone")))
    }
}

#[cfg(test)]
mod tests {
    use flowmesh_common::{OperatorId, UnitId};

    use super::*;
    use crate::tuple::Tuple;

    #[tokio::test]
    async fn publishes_to_registered_workflow() {
        let hub = OutputHub::new();
        let mut rx = hub.register(WorkflowId(1), 8);
        let sender = UnitId::new(WorkflowId(1), OperatorId(1), "SinkLayer0");
        hub.publish(
            WorkflowId(1),
            PayloadMessage::data(sender, 0, vec![Tuple::from_fields(&["v"])]),
        )
        .await
        .expect("publish");

        let msg = rx.recv().await.expect("message");
        assert_eq!(msg.tuple_count(), 1);
    }

    #[tokio::test]
    async fn publish_without_registration_fails() {
        let hub = OutputHub::new();
        let sender = UnitId::new(WorkflowId(9), OperatorId(1), "SinkLayer0");
        let err = hub
            .publish(WorkflowId(9), PayloadMessage::end(sender, 0, vec![]))
            .await
            .expect_err("must fail");
        assert!(matches!(err, FlowError::Execution(_)));
    }
}
