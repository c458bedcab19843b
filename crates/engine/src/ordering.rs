//! Inbound ordering/dedup enforcement in front of each processor.

use std::collections::{BTreeMap, HashMap};

use flowmesh_common::UnitId;
use tracing::debug;

use crate::tuple::PayloadMessage;

/// Reconciles out-of-order and duplicate network delivery so the processor
/// observes each sender's messages exactly once, in sequence order.
///
/// No ordering is enforced across different senders.
#[derive(Debug, Default)]
pub struct OrderingEnforcer {
    streams: HashMap<UnitId, SenderStream>,
}

#[derive(Debug, Default)]
struct SenderStream {
    expected: u64,
    pending: BTreeMap<u64, PayloadMessage>,
}

impl OrderingEnforcer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one arrival; returns the maximal run of messages now releasable
    /// in order. Stale and duplicate sequence numbers are dropped.
    pub fn observe(&mut self, msg: PayloadMessage) -> Vec<PayloadMessage> {
        let stream = self.streams.entry(msg.sender.clone()).or_default();
        if msg.seq < stream.expected || stream.pending.contains_key(&msg.seq) {
            debug!(sender = %msg.sender, seq = msg.seq, "duplicate or stale message dropped");
            return Vec::new();
        }
        stream.pending.insert(msg.seq, msg);

        let mut released = Vec::new();
        while let Some(next) = stream.pending.remove(&stream.expected) {
            stream.expected += 1;
            released.push(next);
        }
        released
    }

    /// Messages buffered waiting for a gap to fill, across all senders.
    pub fn pending_count(&self) -> usize {
        self.streams.values().map(|s| s.pending.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use flowmesh_common::{OperatorId, WorkflowId};

    use super::*;
    use crate::tuple::Tuple;

    fn sender(name: &str) -> UnitId {
        UnitId::new(WorkflowId(1), OperatorId(1), name)
    }

    fn msg(from: &str, seq: u64) -> PayloadMessage {
        PayloadMessage::data(sender(from), seq, vec![Tuple::from_fields(&["x"])])
    }

    #[test]
    fn releases_in_order_run() {
        let mut ord = OrderingEnforcer::new();
        assert_eq!(ord.observe(msg("a", 0)).len(), 1);
        assert_eq!(ord.observe(msg("a", 1)).len(), 1);
    }

    #[test]
    fn buffers_gap_until_filled() {
        let mut ord = OrderingEnforcer::new();
        assert!(ord.observe(msg("a", 2)).is_empty());
        assert!(ord.observe(msg("a", 1)).is_empty());
        assert_eq!(ord.pending_count(), 2);
        let released = ord.observe(msg("a", 0));
        assert_eq!(
            released.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(ord.pending_count(), 0);
    }

    #[test]
    fn drops_duplicates_and_stale() {
        let mut ord = OrderingEnforcer::new();
        assert_eq!(ord.observe(msg("a", 0)).len(), 1);
        assert!(ord.observe(msg("a", 0)).is_empty());
        assert!(ord.observe(msg("a", 2)).is_empty());
        assert!(ord.observe(msg("a", 2)).is_empty());
        assert_eq!(ord.observe(msg("a", 1)).len(), 2);
    }

    #[test]
    fn senders_are_independent() {
        let mut ord = OrderingEnforcer::new();
        assert!(ord.observe(msg("a", 1)).is_empty());
        assert_eq!(ord.observe(msg("b", 0)).len(), 1);
        assert_eq!(ord.observe(msg("a", 0)).len(), 2);
    }
}
