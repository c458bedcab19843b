//! Fixture operators, processors, and output helpers shared by the
//! integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use flowmesh_common::{FlowError, OperatorId, Result};
use flowmesh_engine::layer::{ProcessorWorkerLayer, ProducerWorkerLayer};
use flowmesh_engine::operator::{InputRouting, LayerBuilder, Operator, Topology};
use flowmesh_engine::processor::{TupleProcessor, TupleProducer};
use flowmesh_engine::routing::RoutingKey;
use flowmesh_engine::tuple::{PayloadMessage, Tuple};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// In-memory pull source.
pub struct VecProducer {
    tuples: VecDeque<Tuple>,
}

impl VecProducer {
    pub fn new(tuples: Vec<Tuple>) -> Self {
        Self {
            tuples: tuples.into(),
        }
    }
}

impl TupleProducer for VecProducer {
    fn next_batch(&mut self, max: usize) -> Result<Option<Vec<Tuple>>> {
        if self.tuples.is_empty() {
            return Ok(None);
        }
        let take = max.min(self.tuples.len());
        Ok(Some(self.tuples.drain(..take).collect()))
    }
}

/// Counts accepted tuples; emits the total as a single tuple on `no_more`.
pub struct CountProcessor {
    count: u64,
    out: VecDeque<Tuple>,
}

impl CountProcessor {
    pub fn new() -> Self {
        Self {
            count: 0,
            out: VecDeque::new(),
        }
    }
}

impl TupleProcessor for CountProcessor {
    fn accept(&mut self, _tuple: Tuple) -> Result<()> {
        self.count += 1;
        Ok(())
    }

    fn no_more(&mut self) -> Result<()> {
        self.out.push_back(Tuple::new(vec![self.count.to_string()]));
        Ok(())
    }

    fn has_next(&self) -> bool {
        !self.out.is_empty()
    }

    fn next(&mut self) -> Option<Tuple> {
        self.out.pop_front()
    }
}

/// Per-key record counter; emits `[key, count]` tuples on `no_more`.
pub struct GroupByCountProcessor {
    key_index: usize,
    groups: BTreeMap<String, u64>,
    out: VecDeque<Tuple>,
}

impl GroupByCountProcessor {
    pub fn new(key_index: usize) -> Self {
        Self {
            key_index,
            groups: BTreeMap::new(),
            out: VecDeque::new(),
        }
    }
}

impl TupleProcessor for GroupByCountProcessor {
    fn accept(&mut self, tuple: Tuple) -> Result<()> {
        let key = tuple.field(self.key_index).ok_or_else(|| {
            FlowError::Execution(format!(
                "group key field {} missing on tuple of arity {}",
                self.key_index,
                tuple.arity()
            ))
        })?;
        *self.groups.entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn no_more(&mut self) -> Result<()> {
        for (key, count) in std::mem::take(&mut self.groups) {
            self.out
                .push_back(Tuple::new(vec![key, count.to_string()]));
        }
        Ok(())
    }

    fn has_next(&self) -> bool {
        !self.out.is_empty()
    }

    fn next(&mut self) -> Option<Tuple> {
        self.out.pop_front()
    }
}

/// Scan operator: one producer layer, one in-memory partition per worker.
pub struct FixtureScan {
    id: OperatorId,
    partitions: Arc<Vec<Vec<Tuple>>>,
}

impl FixtureScan {
    pub fn new(id: OperatorId, partitions: Vec<Vec<Tuple>>) -> Self {
        Self {
            id,
            partitions: Arc::new(partitions),
        }
    }

    pub fn single(id: OperatorId, rows: Vec<Tuple>) -> Self {
        Self::new(id, vec![rows])
    }
}

impl Operator for FixtureScan {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn generate_topology(&self) -> Result<Topology> {
        let partitions = Arc::clone(&self.partitions);
        let layer = ProducerWorkerLayer::new(
            "ScanLayer",
            self.partitions.len(),
            Box::new(move |i| {
                Box::new(VecProducer::new(partitions[i].clone())) as Box<dyn TupleProducer>
            }),
        );
        Ok(Topology {
            layers: vec![LayerBuilder::Producer(layer)],
            links: vec![],
        })
    }
}

/// Count operator: one processor layer with a configurable inbound routing.
pub struct FixtureCount {
    id: OperatorId,
    workers: usize,
    routing: InputRouting,
}

impl FixtureCount {
    pub fn new(id: OperatorId, workers: usize, routing: InputRouting) -> Self {
        Self {
            id,
            workers,
            routing,
        }
    }
}

impl Operator for FixtureCount {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn generate_topology(&self) -> Result<Topology> {
        let layer = ProcessorWorkerLayer::new(
            "CountLayer",
            self.workers,
            Box::new(|_| Box::new(CountProcessor::new()) as Box<dyn TupleProcessor>),
        );
        Ok(Topology {
            layers: vec![LayerBuilder::Processor(layer)],
            links: vec![],
        })
    }

    fn input_routing(&self, _from: &OperatorId) -> InputRouting {
        self.routing.clone()
    }
}

/// Group-by operator keyed by a field index; always shuffle-linked on it.
pub struct FixtureGroupBy {
    id: OperatorId,
    workers: usize,
    key_index: usize,
}

impl FixtureGroupBy {
    pub fn new(id: OperatorId, workers: usize, key_index: usize) -> Self {
        Self {
            id,
            workers,
            key_index,
        }
    }
}

impl Operator for FixtureGroupBy {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn generate_topology(&self) -> Result<Topology> {
        let key_index = self.key_index;
        let layer = ProcessorWorkerLayer::new(
            "GroupByLayer",
            self.workers,
            Box::new(move |_| {
                Box::new(GroupByCountProcessor::new(key_index)) as Box<dyn TupleProcessor>
            }),
        );
        Ok(Topology {
            layers: vec![LayerBuilder::Processor(layer)],
            links: vec![],
        })
    }

    fn input_routing(&self, _from: &OperatorId) -> InputRouting {
        InputRouting::HashShuffle(RoutingKey::by_field(self.key_index))
    }
}

/// Drain the output stream until `end_flags` terminal markers arrived.
pub async fn drain_output(
    rx: &mut mpsc::Receiver<PayloadMessage>,
    end_flags: usize,
) -> Vec<PayloadMessage> {
    let mut messages = Vec::new();
    let mut ends = 0;
    while ends < end_flags {
        let msg = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("output stream stalled")
            .expect("output stream closed early");
        if msg.end_of_stream {
            ends += 1;
        }
        messages.push(msg);
    }
    messages
}

pub fn tuples_of(messages: &[PayloadMessage]) -> Vec<Tuple> {
    messages
        .iter()
        .filter_map(|m| m.batch.as_ref())
        .flatten()
        .cloned()
        .collect()
}

/// `n` single-field rows `r0..r{n-1}`.
pub fn rows(n: usize) -> Vec<Tuple> {
    (0..n).map(|i| Tuple::new(vec![format!("r{i}")])).collect()
}
