use async_trait::async_trait;
use flowmesh_common::metrics::global_metrics;
use flowmesh_common::{Result, UnitId};
use tracing::debug;

use super::SendStrategy;
use crate::sending::SendingUnit;
use crate::tuple::{PayloadMessage, Tuple};

/// Rotating strategy: cycles receivers in a fixed order, advancing once per
/// batch boundary.
///
/// Receivers appended after construction (isolated/unmatched destinations)
/// join the same rotation, so no layer member is ever starved.
pub struct RoundRobinSend {
    receivers: Vec<SendingUnit>,
    seqs: Vec<u64>,
    cursor: usize,
    buffer: Vec<Tuple>,
    batch_size: usize,
    paused: bool,
    ended: bool,
}

impl RoundRobinSend {
    const NAME: &'static str = "round_robin";

    pub fn new(batch_size: usize) -> Self {
        Self {
            receivers: Vec::new(),
            seqs: Vec::new(),
            cursor: 0,
            buffer: Vec::new(),
            batch_size: batch_size.max(1),
            paused: false,
            ended: false,
        }
    }

    async fn send_one(&mut self, sender: &UnitId, batch: Vec<Tuple>, end: bool) {
        let workflow = sender.workflow.to_string();
        let i = self.cursor;
        let msg = if end {
            PayloadMessage::end(sender.clone(), self.seqs[i], batch)
        } else {
            PayloadMessage::data(sender.clone(), self.seqs[i], batch)
        };
        if self.receivers[i]
            .send(msg, &workflow, Self::NAME)
            .await
            .is_delivered()
        {
            self.seqs[i] += 1;
            global_metrics().record_message_sent(&workflow, Self::NAME);
        }
        self.cursor = (self.cursor + 1) % self.receivers.len();
    }
}

#[async_trait]
impl SendStrategy for RoundRobinSend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_receiver(&mut self, unit: SendingUnit) {
        self.receivers.push(unit);
        self.seqs.push(0);
    }

    fn remove_all_receivers(&mut self) {
        self.receivers.clear();
        self.seqs.clear();
        self.cursor = 0;
    }

    fn receivers(&self) -> Vec<UnitId> {
        self.receivers
            .iter()
            .map(|u| u.receiver_id().clone())
            .collect()
    }

    fn enqueue(&mut self, mut batch: Vec<Tuple>) -> Result<()> {
        self.buffer.append(&mut batch);
        Ok(())
    }

    async fn send_batched(&mut self, sender: &UnitId) -> Result<()> {
        if self.receivers.is_empty() {
            debug!(sender = %sender, "round-robin strategy has no receivers yet");
            return Ok(());
        }
        while !self.paused && self.buffer.len() >= self.batch_size {
            let batch: Vec<Tuple> = self.buffer.drain(..self.batch_size).collect();
            self.send_one(sender, batch, false).await;
        }
        Ok(())
    }

    async fn send_end(&mut self, sender: &UnitId) -> Result<()> {
        if self.ended || self.receivers.is_empty() {
            return Ok(());
        }
        // Leftover shorter than a full batch still goes to the rotation
        // target; end markers then fan out to every receiver.
        if !self.buffer.is_empty() {
            let leftover: Vec<Tuple> = self.buffer.drain(..).collect();
            self.send_one(sender, leftover, false).await;
        }
        let workflow = sender.workflow.to_string();
        for i in 0..self.receivers.len() {
            let msg = PayloadMessage::end(sender.clone(), self.seqs[i], vec![]);
            if self.receivers[i]
                .send(msg, &workflow, Self::NAME)
                .await
                .is_delivered()
            {
                self.seqs[i] += 1;
                global_metrics().record_message_sent(&workflow, Self::NAME);
            }
        }
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
