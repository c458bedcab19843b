use async_trait::async_trait;
use flowmesh_common::metrics::global_metrics;
use flowmesh_common::{FlowError, Result, UnitId};

use super::SendStrategy;
use crate::routing::RoutingKey;
use crate::sending::SendingUnit;
use crate::tuple::{PayloadMessage, Tuple};

/// Keyed strategy: routes each tuple by its routing key modulo the receiver
/// count, so all tuples sharing a key land on the same destination worker.
///
/// The receiver order is the destination layer's identity order and must be
/// identical across all senders of a link; location affinity shows up only
/// in the sending-unit kind (flow-controlled local path vs plain remote
/// path), never in the modulo domain.
pub struct HashShuffleSend {
    routing: RoutingKey,
    receivers: Vec<SendingUnit>,
    seqs: Vec<u64>,
    buffers: Vec<Vec<Tuple>>,
    batch_size: usize,
    paused: bool,
    ended: bool,
}

impl HashShuffleSend {
    const NAME: &'static str = "hash_shuffle";

    pub fn new(routing: RoutingKey, batch_size: usize) -> Self {
        Self {
            routing,
            receivers: Vec::new(),
            seqs: Vec::new(),
            buffers: Vec::new(),
            batch_size: batch_size.max(1),
            paused: false,
            ended: false,
        }
    }

    pub fn routing(&self) -> &RoutingKey {
        &self.routing
    }

    async fn flush_receiver(&mut self, sender: &UnitId, i: usize, flush_all: bool) {
        let workflow = sender.workflow.to_string();
        loop {
            let len = self.buffers[i].len();
            let take = if len >= self.batch_size {
                self.batch_size
            } else if flush_all && len > 0 {
                len
            } else {
                break;
            };
            let batch: Vec<Tuple> = self.buffers[i].drain(..take).collect();
            let msg = PayloadMessage::data(sender.clone(), self.seqs[i], batch);
            if self.receivers[i]
                .send(msg, &workflow, Self::NAME)
                .await
                .is_delivered()
            {
                self.seqs[i] += 1;
                global_metrics().record_message_sent(&workflow, Self::NAME);
            }
        }
    }
}

#[async_trait]
impl SendStrategy for HashShuffleSend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_receiver(&mut self, unit: SendingUnit) {
        self.receivers.push(unit);
        self.seqs.push(0);
        self.buffers.push(Vec::new());
    }

    fn remove_all_receivers(&mut self) {
        self.receivers.clear();
        self.seqs.clear();
        self.buffers.clear();
    }

    fn receivers(&self) -> Vec<UnitId> {
        self.receivers
            .iter()
            .map(|u| u.receiver_id().clone())
            .collect()
    }

    fn enqueue(&mut self, batch: Vec<Tuple>) -> Result<()> {
        if self.receivers.is_empty() {
            return Err(FlowError::Execution(
                "hash shuffle strategy has no receivers".to_string(),
            ));
        }
        let n = self.receivers.len() as u64;
        for tuple in batch {
            let i = (self.routing.key(&tuple)? % n) as usize;
            self.buffers[i].push(tuple);
        }
        Ok(())
    }

    async fn send_batched(&mut self, sender: &UnitId) -> Result<()> {
        if self.paused {
            return Ok(());
        }
        for i in 0..self.receivers.len() {
            self.flush_receiver(sender, i, false).await;
        }
        Ok(())
    }

    async fn send_end(&mut self, sender: &UnitId) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let workflow = sender.workflow.to_string();
        for i in 0..self.receivers.len() {
            self.flush_receiver(sender, i, true).await;
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

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use flowmesh_common::FlowError;
    use tokio::sync::mpsc;

    use super::*;
    use crate::routing::RoutingKey;
    use crate::send::SendStrategy;
    use crate::sending::{RetryPolicy, SendingUnit};
    use crate::test_util::{spawn_probe, test_cluster, unit_id};
    use crate::tuple::{PayloadMessage, Tuple};

    async fn drain_stream(
        rx: &mut mpsc::Receiver<PayloadMessage>,
        expected_ends: usize,
    ) -> Vec<Tuple> {
        let mut tuples = Vec::new();
        let mut ends = 0;
        while ends < expected_ends {
            let msg = rx.recv().await.expect("message");
            if let Some(batch) = msg.batch {
                tuples.extend(batch);
            }
            if msg.end_of_stream {
                ends += 1;
            }
        }
        tuples
    }

    #[tokio::test]
    async fn equal_keys_land_on_the_same_receiver_from_any_sender() {
        let cluster = test_cluster();
        let (h0, mut rx0) = spawn_probe(&cluster, "probe0").await;
        let (h1, mut rx1) = spawn_probe(&cluster, "probe1").await;

        // Two independent senders over the same identity-ordered receiver set.
        let mut strategies = Vec::new();
        for _ in 0..2 {
            let mut s = HashShuffleSend::new(RoutingKey::by_field(0), 4);
            s.add_receiver(SendingUnit::plain(h0.clone(), RetryPolicy::default()));
            s.add_receiver(SendingUnit::plain(h1.clone(), RetryPolicy::default()));
            strategies.push(s);
        }

        let senders = [unit_id("ScanLayerA0"), unit_id("ScanLayerB0")];
        for (strategy, sender) in strategies.iter_mut().zip(&senders) {
            let tuples: Vec<Tuple> = (0..10)
                .map(|k| Tuple::new(vec![format!("k{k}"), sender.name.clone()]))
                .collect();
            strategy.enqueue(tuples).expect("enqueue");
            strategy.send_end(sender).await.expect("end");
        }

        let at0 = drain_stream(&mut rx0, 2).await;
        let at1 = drain_stream(&mut rx1, 2).await;

        let mut owner: HashMap<String, usize> = HashMap::new();
        for t in &at0 {
            let prev = owner.insert(t.field(0).expect("key").to_string(), 0);
            assert!(prev.is_none() || prev == Some(0));
        }
        for t in &at1 {
            let prev = owner.insert(t.field(0).expect("key").to_string(), 1);
            assert!(prev.is_none() || prev == Some(1));
        }
        // Every key observed, each by exactly one destination worker, from
        // both senders.
        let keys: HashSet<&String> = owner.keys().collect();
        assert_eq!(keys.len(), 10);
        assert_eq!(at0.len() + at1.len(), 20);
    }

    #[tokio::test]
    async fn single_receiver_takes_every_key() {
        let cluster = test_cluster();
        let (h0, mut rx0) = spawn_probe(&cluster, "probe0").await;
        let mut strategy = HashShuffleSend::new(RoutingKey::by_field(0), 2);
        strategy.add_receiver(SendingUnit::plain(h0, RetryPolicy::default()));

        let sender = unit_id("ScanLayer0");
        let tuples: Vec<Tuple> = (0..5).map(|k| Tuple::new(vec![format!("k{k}")])).collect();
        strategy.enqueue(tuples).expect("enqueue");
        strategy.send_end(&sender).await.expect("end");

        assert_eq!(drain_stream(&mut rx0, 1).await.len(), 5);
    }

    #[tokio::test]
    async fn enqueue_without_receivers_is_an_execution_error() {
        let mut strategy = HashShuffleSend::new(RoutingKey::by_field(0), 2);
        let err = strategy
            .enqueue(vec![Tuple::from_fields(&["k"])])
            .expect_err("must fail");
        assert!(matches!(err, FlowError::Execution(_)));
    }
}
