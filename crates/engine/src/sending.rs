//! Per-receiver delivery units: bounded retry, typed outcomes, flow control.

use std::time::Duration;

use flowmesh_cluster::UnitHandle;
use flowmesh_common::metrics::global_metrics;
use flowmesh_common::{EngineConfig, UnitId};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::warn;

use crate::tuple::PayloadMessage;
use crate::worker::WorkerEvent;

/// Bounded-retry delivery policy for transient send failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Resend attempts after the first failed delivery.
    pub max_retries: u32,
    /// Fixed delay between attempts; also the per-attempt delivery timeout.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.send_max_retries,
            Duration::from_millis(config.send_retry_backoff_ms),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250))
    }
}

/// Typed delivery result.
///
/// Retry exhaustion degrades to a drop rather than an error: liveness over
/// completeness, with the loss observable through the drop counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Dropped { attempts: u32 },
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// One unit-of-send wrapping a single receiving worker.
///
/// A plain unit retries transient failures with fixed backoff and gives up
/// after the bound. A flow-controlled unit additionally waits for the
/// receiver's cooperative-backpressure flag to clear before each send.
pub struct SendingUnit {
    receiver: UnitHandle<WorkerEvent>,
    retry: RetryPolicy,
    pause: Option<watch::Receiver<bool>>,
}

impl SendingUnit {
    pub fn plain(receiver: UnitHandle<WorkerEvent>, retry: RetryPolicy) -> Self {
        Self {
            receiver,
            retry,
            pause: None,
        }
    }

    pub fn flow_controlled(receiver: UnitHandle<WorkerEvent>, retry: RetryPolicy) -> Self {
        let pause = receiver.backpressure_watch();
        Self {
            receiver,
            retry,
            pause: Some(pause),
        }
    }

    pub fn receiver_id(&self) -> &UnitId {
        self.receiver.identity()
    }

    pub fn receiver(&self) -> &UnitHandle<WorkerEvent> {
        &self.receiver
    }

    pub fn is_flow_controlled(&self) -> bool {
        self.pause.is_some()
    }

    /// Deliver one payload message, honoring flow control and the retry
    /// bound. `workflow` and `strategy` label the retry/drop metrics.
    pub async fn send(
        &mut self,
        msg: PayloadMessage,
        workflow: &str,
        strategy: &'static str,
    ) -> SendOutcome {
        if let Some(pause) = self.pause.as_mut() {
            // Cooperative backpressure: stall until the receiver clears its flag.
            let _ = pause.wait_for(|paused| !*paused).await;
        }

        let mut pending = WorkerEvent::Payload(msg);
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.receiver.try_deliver(pending, self.retry.backoff).await {
                Ok(()) => return SendOutcome::Delivered,
                Err(returned) => {
                    if attempts > self.retry.max_retries {
                        warn!(
                            receiver = %self.receiver.identity(),
                            attempts,
                            strategy,
                            "message dropped after exhausting delivery retries"
                        );
                        global_metrics().record_message_dropped(workflow, strategy);
                        return SendOutcome::Dropped { attempts };
                    }
                    global_metrics().record_send_retry(workflow, strategy);
                    sleep(self.retry.backoff).await;
                    pending = returned;
                }
            }
        }
    }
}
