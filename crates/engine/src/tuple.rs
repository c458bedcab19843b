//! Tuple and payload-message wire model.

use std::fmt;

use flowmesh_common::UnitId;
use serde::{Deserialize, Serialize};

/// Immutable ordered record of string fields.
///
/// Tuples have no identity beyond their position in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple(Vec<String>);

impl Tuple {
    pub fn new(fields: Vec<String>) -> Self {
        Self(fields)
    }

    pub fn from_fields(fields: &[&str]) -> Self {
        Self(fields.iter().map(|f| f.to_string()).collect())
    }

    pub fn field(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("|"))
    }
}

/// Unit of transport between worker units: a batch of tuples plus sequencing
/// metadata.
///
/// Sequence numbers are monotonic per (sender, receiver) edge and gapless
/// from the receiver's point of view. The final message from a sender sets
/// `end_of_stream` and may carry no batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadMessage {
    /// Identity of the sending worker unit.
    pub sender: UnitId,
    /// Edge-scoped monotonic sequence number.
    pub seq: u64,
    /// Tuples carried by this message, if any.
    pub batch: Option<Vec<Tuple>>,
    /// Marks the sender's final message on this edge.
    pub end_of_stream: bool,
}

impl PayloadMessage {
    pub fn data(sender: UnitId, seq: u64, batch: Vec<Tuple>) -> Self {
        Self {
            sender,
            seq,
            batch: Some(batch),
            end_of_stream: false,
        }
    }

    pub fn end(sender: UnitId, seq: u64, batch: Vec<Tuple>) -> Self {
        Self {
            sender,
            seq,
            batch: if batch.is_empty() { None } else { Some(batch) },
            end_of_stream: true,
        }
    }

    pub fn tuple_count(&self) -> usize {
        self.batch.as_ref().map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use flowmesh_common::{OperatorId, WorkflowId};

    use super::*;

    #[test]
    fn tuple_field_access() {
        let t = Tuple::from_fields(&["a", "b", "c"]);
        assert_eq!(t.field(1), Some("b"));
        assert_eq!(t.field(3), None);
        assert_eq!(t.arity(), 3);
        assert_eq!(t.to_string(), "a|b|c");
    }

    #[test]
    fn end_message_elides_empty_batch() {
        let sender = UnitId::new(WorkflowId(1), OperatorId(1), "ScanLayer0");
        let end = PayloadMessage::end(sender, 4, vec![]);
        assert!(end.end_of_stream);
        assert!(end.batch.is_none());
        assert_eq!(end.tuple_count(), 0);
    }
}
