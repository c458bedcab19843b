//! Send strategies: batching + routing + delivery for worker output.
//!
//! One strategy instance is installed per source worker at link time. A
//! strategy owns its receiver sending-units, outbound batch buffers, and one
//! monotonic sequence counter per destination edge.
//!
//! Delivery note: a batch dropped after retry exhaustion must not leave a
//! sequence gap, so the edge counter only advances on delivered messages.

mod all_to_one;
mod hash_shuffle;
mod observer;
mod one_to_one;
mod round_robin;

pub use all_to_one::AllToOneSend;
pub use hash_shuffle::HashShuffleSend;
pub use observer::ObserverSend;
pub use one_to_one::OneToOneSend;
pub use round_robin::RoundRobinSend;

use async_trait::async_trait;
use flowmesh_common::{Result, UnitId};

use crate::sending::SendingUnit;
use crate::tuple::Tuple;

/// Outbound routing contract every worker drives.
///
/// While the pause flag is set, `send_batched` buffers without sending;
/// `resume_sending` clears the flag and flushes whatever became eligible.
#[async_trait]
pub trait SendStrategy: Send {
    /// Strategy tag used in logs and metrics labels.
    fn name(&self) -> &'static str;

    fn add_receiver(&mut self, unit: SendingUnit);

    fn remove_all_receivers(&mut self);

    fn receivers(&self) -> Vec<UnitId>;

    /// Buffer processor output for later delivery.
    fn enqueue(&mut self, batch: Vec<Tuple>) -> Result<()>;

    /// Deliver all complete batches.
    async fn send_batched(&mut self, sender: &UnitId) -> Result<()>;

    /// Flush every remaining tuple and deliver end-of-stream on each edge.
    async fn send_end(&mut self, sender: &UnitId) -> Result<()>;

    fn set_pause_flag(&mut self, paused: bool);

    async fn resume_sending(&mut self, sender: &UnitId) -> Result<()>;
}
