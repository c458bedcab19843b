use async_trait::async_trait;
use flowmesh_common::metrics::global_metrics;
use flowmesh_common::{Result, UnitId};
use tracing::debug;

use super::SendStrategy;
use crate::sending::SendingUnit;
use crate::tuple::{PayloadMessage, Tuple};

/// Single-receiver strategy: batches up to the configured size and sends
/// sequentially, each message carrying the next sequence number.
pub struct OneToOneSend {
    receiver: Option<SendingUnit>,
    seq: u64,
    buffer: Vec<Tuple>,
    batch_size: usize,
    paused: bool,
    ended: bool,
}

impl OneToOneSend {
    const NAME: &'static str = "one_to_one";

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
impl SendStrategy for OneToOneSend {
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
            debug!(sender = %sender, "one-to-one strategy has no receiver yet");
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

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;
    use crate::send::SendStrategy;
    use crate::sending::{RetryPolicy, SendingUnit};
    use crate::test_util::{spawn_probe, test_cluster, unit_id};
    use crate::tuple::Tuple;

    #[tokio::test]
    async fn sequence_numbers_advance_per_delivered_batch() {
        let cluster = test_cluster();
        let (handle, mut rx) = spawn_probe(&cluster, "probe0").await;
        let mut strategy = OneToOneSend::new(2);
        strategy.add_receiver(SendingUnit::plain(handle, RetryPolicy::default()));

        let sender = unit_id("ScanLayer0");
        let tuples: Vec<Tuple> = (0..5).map(|i| Tuple::new(vec![i.to_string()])).collect();
        strategy.enqueue(tuples).expect("enqueue");
        strategy.send_batched(&sender).await.expect("send");
        strategy.send_end(&sender).await.expect("end");

        let first = rx.recv().await.expect("batch");
        let second = rx.recv().await.expect("batch");
        let end = rx.recv().await.expect("end");
        assert_eq!((first.seq, second.seq, end.seq), (0, 1, 2));
        assert!(end.end_of_stream);
        // The odd tuple rides in the end message.
        assert_eq!(end.tuple_count(), 1);
    }

    #[tokio::test]
    async fn pause_flag_buffers_until_resume() {
        let cluster = test_cluster();
        let (handle, mut rx) = spawn_probe(&cluster, "probe0").await;
        let mut strategy = OneToOneSend::new(1);
        strategy.add_receiver(SendingUnit::plain(handle, RetryPolicy::default()));

        let sender = unit_id("ScanLayer0");
        strategy.set_pause_flag(true);
        strategy
            .enqueue(vec![Tuple::from_fields(&["a"]), Tuple::from_fields(&["b"])])
            .expect("enqueue");
        strategy.send_batched(&sender).await.expect("send");

        sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        strategy.resume_sending(&sender).await.expect("resume");
        assert_eq!(rx.recv().await.expect("first").seq, 0);
        assert_eq!(rx.recv().await.expect("second").seq, 1);
    }
}
