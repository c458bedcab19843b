use serde::{Deserialize, Serialize};

/// Engine-wide tunables passed across layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tuples per outbound payload message.
    pub batch_size: usize,
    /// Max resend attempts after the first failed delivery.
    pub send_max_retries: u32,
    /// Fixed delay between resend attempts, in milliseconds.
    pub send_retry_backoff_ms: u64,
    /// Bounded mailbox capacity per worker unit.
    pub mailbox_capacity: usize,
    /// Bounded per-workflow output channel capacity.
    pub output_capacity: usize,
    /// Tuples a producer worker pulls from its source per production step.
    pub producer_pull_batch: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 400,
            send_max_retries: 3,
            send_retry_backoff_ms: 250,
            mailbox_capacity: 1024,
            output_capacity: 1024,
            producer_pull_batch: 400,
        }
    }
}
