use std::sync::Arc;

use async_trait::async_trait;
use flowmesh_common::metrics::global_metrics;
use flowmesh_common::{Result, UnitId, WorkflowId};
use tracing::debug;

use super::SendStrategy;
use crate::output::OutputHub;
use crate::sending::SendingUnit;
use crate::tuple::{PayloadMessage, Tuple};

/// Terminal strategy with no worker receiver: publishes batches onto the
/// workflow's external output channel.
pub struct ObserverSend {
    hub: Arc<OutputHub>,
    workflow: WorkflowId,
    seq: u64,
    buffer: Vec<Tuple>,
    batch_size: usize,
    paused: bool,
    ended: bool,
}

impl ObserverSend {
    const NAME: &'static str = "observer";

    pub fn new(hub: Arc<OutputHub>, workflow: WorkflowId, batch_size: usize) -> Self {
        Self {
            hub,
            workflow,
            seq: 0,
            buffer: Vec::new(),
            batch_size: batch_size.max(1),
            paused: false,
            ended: false,
        }
    }

    async fn publish(&mut self, msg: PayloadMessage) -> Result<()> {
        self.hub.publish(self.workflow, msg).await?;
        self.seq += 1;
        global_metrics().record_message_sent(&self.workflow.to_string(), Self::NAME);
        Ok(())
    }
}

#[async_trait]
impl SendStrategy for ObserverSend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_receiver(&mut self, unit: SendingUnit) {
        debug!(
            receiver = %unit.receiver_id(),
            "observer strategy is terminal; receiver ignored"
        );
    }

    fn remove_all_receivers(&mut self) {}

    fn receivers(&self) -> Vec<UnitId> {
        Vec::new()
    }

    fn enqueue(&mut self, mut batch: Vec<Tuple>) -> Result<()> {
        self.buffer.append(&mut batch);
        Ok(())
    }

    async fn send_batched(&mut self, sender: &UnitId) -> Result<()> {
        while !self.paused && self.buffer.len() >= self.batch_size {
            let batch: Vec<Tuple> = self.buffer.drain(..self.batch_size).collect();
            let msg = PayloadMessage::data(sender.clone(), self.seq, batch);
            self.publish(msg).await?;
        }
        Ok(())
    }

    async fn send_end(&mut self, sender: &UnitId) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let leftover: Vec<Tuple> = self.buffer.drain(..).collect();
        let msg = PayloadMessage::end(sender.clone(), self.seq, leftover);
        self.publish(msg).await?;
        self.ended = true;
        Ok(())
    }

    fn set_pause_flag(&mut self, paused: bool) {
        self.paused = paused;
    }

    async fn resume_sending(&mut self, sender: &UnitId) -> Result<()> {
        self.paused = false;
        self.send_batched(sender).await
    }
}
