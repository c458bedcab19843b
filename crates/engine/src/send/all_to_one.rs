use async_trait::async_trait;
use flowmesh_common::metrics::global_metrics;
use flowmesh_common::{Result, UnitId};
use tracing::debug;

use super::SendStrategy;
use crate::sending::SendingUnit;
use crate::tuple::{PayloadMessage, Tuple};

/// Funnel strategy: every source worker of the link is wired to the same
/// single receiver.
///
/// The destination-cardinality-is-one precondition is enforced at link time;
/// by the time a worker drives this strategy it holds exactly one receiver.
pub struct AllToOneSend {
    receiver: Option<SendingUnit>,
    seq: u64,
    buffer: Vec<Tuple>,
    batch_size: usize,
    paused: bool,
    ended: bool,
}

impl AllToOneSend {
    const NAME: &'static str = "all_to_one";

    pub fn new(batch_size: usize) -> Self {
        Self {
            receiver: None,
            seq: 0,
            buffer: Vec::new(),
            batch_size: batch_size.max(1),
            paused: false,
            ended: false,
        }
    }
}

#[async_trait]
impl SendStrategy for AllToOneSend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_receiver(&mut self, unit: SendingUnit) {
        self.receiver = Some(unit);
    }

    fn remove_all_receivers(&mut self) {
        self.receiver = None;
    }

    fn receivers(&self) -> Vec<UnitId> {
        self.receiver
            .as_ref()
            .map(|u| vec![u.receiver_id().clone()])
            .unwrap_or_default()
    }

    fn enqueue(&mut self, mut batch: Vec<Tuple>) -> Result<()> {
        self.buffer.append(&mut batch);
        Ok(())
    }

    async fn send_batched(&mut self, sender: &UnitId) -> Result<()> {
        if self.paused {
            return Ok(());
        }
        let Some(unit) = self.receiver.as_mut() else {
            debug!(sender = %sender, "all-to-one strategy has no receiver yet");
            return Ok(());
        };
        let workflow = sender.workflow.to_string();
        while self.buffer.len() >= self.batch_size {
            let batch: Vec<Tuple> = self.buffer.drain(..self.batch_size).collect();
            let msg = PayloadMessage::data(sender.clone(), self.seq, batch);
            if unit.send(msg, &workflow, Self::NAME).await.is_delivered() {
                self.seq += 1;
                global_metrics().record_message_sent(&workflow, Self::NAME);
            }
        }
        Ok(())
    }

    async fn send_end(&mut self, sender: &UnitId) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let Some(unit) = self.receiver.as_mut() else {
            return Ok(());
        };
        let workflow = sender.workflow.to_string();
        let leftover: Vec<Tuple> = self.buffer.drain(..).collect();
        let msg = PayloadMessage::end(sender.clone(), self.seq, leftover);
        if unit.send(msg, &workflow, Self::NAME).await.is_delivered() {
            self.seq += 1;
            global_metrics().record_message_sent(&workflow, Self::NAME);
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
