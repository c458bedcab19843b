//! Worker unit event loops and their control surface.
//!
//! Responsibilities:
//! - drive one tuple processor (or producer) per unit, strictly
//!   single-threaded from the unit's own mailbox;
//! - enforce per-sender message ordering before the processor sees input;
//! - drain processor output through the installed send strategy;
//! - honor pause/resume, breakpoint assignment, and graceful deactivation;
//! - notify the controller on breakpoint triggers and completion.
//!
//! A paused worker defers payload processing and raises its cooperative
//! backpressure flag; upstream flow-controlled senders stall on that flag,
//! which is how pause propagates downstream without an explicit broadcast.

use std::collections::HashSet;

use flowmesh_cluster::UnitContext;
use flowmesh_common::metrics::global_metrics;
use flowmesh_common::UnitId;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::breakpoint::{LocalBreakpoint, LocalBreakpointState};
use crate::ordering::OrderingEnforcer;
use crate::processor::{TupleProcessor, TupleProducer};
use crate::send::SendStrategy;
use crate::tuple::PayloadMessage;

/// Mailbox message type for every worker unit.
pub enum WorkerEvent {
    Payload(PayloadMessage),
    Control(ControlEvent),
}

/// Control surface driven by the controller and link strategies.
pub enum ControlEvent {
    /// Install the outbound send strategy (link time, once per build).
    InstallSendStrategy {
        strategy: Box<dyn SendStrategy>,
        ack: oneshot::Sender<()>,
    },
    /// Add upstream senders whose end-of-stream completes this worker.
    AddExpectedUpstream {
        count: usize,
        ack: oneshot::Sender<()>,
    },
    /// Producers: begin pulling from the source.
    Start,
    Pause {
        ack: oneshot::Sender<()>,
    },
    Resume {
        ack: oneshot::Sender<()>,
    },
    AssignBreakpoint {
        breakpoint: LocalBreakpoint,
        ack: oneshot::Sender<()>,
    },
    RemoveBreakpoint {
        id: String,
        ack: oneshot::Sender<()>,
    },
    /// Pull the current local breakpoint state (collect round-trip).
    QueryBreakpoint {
        id: String,
        reply: oneshot::Sender<Option<LocalBreakpointState>>,
    },
    /// Graceful teardown: dispose and exit the event loop.
    Deactivate {
        ack: oneshot::Sender<()>,
    },
}

/// Upstream notifications from workers to their controller.
#[derive(Debug)]
pub enum WorkerNotice {
    BreakpointTriggered {
        worker: UnitId,
        state: LocalBreakpointState,
    },
    Completed {
        worker: UnitId,
    },
}

/// Processor-driven worker: consumes ordered payload messages, feeds the
/// processor, forwards its output.
pub struct ProcessorWorker {
    processor: Box<dyn TupleProcessor>,
    strategy: Option<Box<dyn SendStrategy>>,
    ordering: OrderingEnforcer,
    sources: HashSet<UnitId>,
    completed_sources: HashSet<UnitId>,
    expected_upstream: usize,
    breakpoint: Option<LocalBreakpoint>,
    deferred: Vec<PayloadMessage>,
    paused: bool,
    finished: bool,
    layer: String,
    notice: mpsc::Sender<WorkerNotice>,
}

impl ProcessorWorker {
    pub fn new(
        processor: Box<dyn TupleProcessor>,
        layer: impl Into<String>,
        notice: mpsc::Sender<WorkerNotice>,
    ) -> Self {
        Self {
            processor,
            strategy: None,
            ordering: OrderingEnforcer::new(),
            sources: HashSet::new(),
            completed_sources: HashSet::new(),
            expected_upstream: 0,
            breakpoint: None,
            deferred: Vec::new(),
            paused: false,
            finished: false,
            layer: layer.into(),
            notice,
        }
    }

    /// Event-loop body handed to cluster activation.
    pub async fn run(mut self, ctx: UnitContext, mut rx: mpsc::Receiver<WorkerEvent>) {
        if let Err(e) = self.processor.initialize().await {
            error!(unit = %ctx.identity(), error = %e, "processor initialization failed");
            return;
        }
        let workflow = ctx.identity().workflow.to_string();
        global_metrics().worker_started(&workflow);
        debug!(unit = %ctx.identity(), location = %ctx.location(), "processor worker started");

        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Payload(msg) if self.paused => self.deferred.push(msg),
                WorkerEvent::Payload(msg) => self.on_payload(&ctx, msg).await,
                WorkerEvent::Control(control) => {
                    if self.on_control(&ctx, control).await {
                        break;
                    }
                }
            }
        }
        global_metrics().worker_stopped(&workflow);
        debug!(unit = %ctx.identity(), "processor worker stopped");
    }

    async fn on_payload(&mut self, ctx: &UnitContext, msg: PayloadMessage) {
        if self.finished {
            debug!(unit = %ctx.identity(), sender = %msg.sender, "payload after completion ignored");
            return;
        }
        for ordered in self.ordering.observe(msg) {
            self.consume(ctx, ordered).await;
        }
    }

    async fn consume(&mut self, ctx: &UnitContext, msg: PayloadMessage) {
        let sender = msg.sender.clone();
        if self.sources.insert(sender.clone()) {
            self.processor.on_register_source(&sender);
        }

        let batch = msg.batch.unwrap_or_default();
        if !batch.is_empty() {
            global_metrics().record_tuples_in(
                &ctx.identity().workflow.to_string(),
                &self.layer,
                batch.len() as u64,
            );
        }

        let mut triggered: Option<LocalBreakpointState> = None;
        for tuple in batch {
            if let Err(e) = self.processor.accept(tuple.clone()) {
                warn!(unit = %ctx.identity(), error = %e, "processor rejected tuple");
                continue;
            }
            if let Some(bp) = self.breakpoint.as_mut() {
                bp.accept(&tuple);
                if bp.is_triggered() && bp.is_dirty() {
                    bp.mark_reported();
                    triggered = Some(bp.snapshot());
                }
            }
        }
        if let Some(state) = triggered {
            self.pause_self(ctx);
            info!(unit = %ctx.identity(), breakpoint = %state.id, "local breakpoint triggered");
            let _ = self
                .notice
                .send(WorkerNotice::BreakpointTriggered {
                    worker: ctx.identity().clone(),
                    state,
                })
                .await;
        }

        self.drain_outputs(ctx).await;

        if msg.end_of_stream {
            self.completed_sources.insert(sender.clone());
            self.processor.mark_source_completed(&sender);
            self.maybe_finish(ctx).await;
        }
    }

    async fn drain_outputs(&mut self, ctx: &UnitContext) {
        let mut out = Vec::new();
        while self.processor.has_next() {
            match self.processor.next() {
                Some(tuple) => out.push(tuple),
                None => break,
            }
        }
        if out.is_empty() {
            return;
        }
        global_metrics().record_tuples_out(
            &ctx.identity().workflow.to_string(),
            &self.layer,
            out.len() as u64,
        );
        if let Some(strategy) = self.strategy.as_mut() {
            if let Err(e) = strategy.enqueue(out) {
                warn!(unit = %ctx.identity(), error = %e, "output enqueue failed");
                return;
            }
            if let Err(e) = strategy.send_batched(ctx.identity()).await {
                warn!(unit = %ctx.identity(), error = %e, "batched send failed");
            }
        }
    }

    async fn maybe_finish(&mut self, ctx: &UnitContext) {
        if self.finished
            || self.expected_upstream == 0
            || self.completed_sources.len() < self.expected_upstream
        {
            return;
        }
        if let Err(e) = self.processor.no_more() {
            warn!(unit = %ctx.identity(), error = %e, "final computation failed");
        }
        self.drain_outputs(ctx).await;
        if let Some(strategy) = self.strategy.as_mut() {
            if let Err(e) = strategy.send_end(ctx.identity()).await {
                warn!(unit = %ctx.identity(), error = %e, "end-of-stream send failed");
            }
        }
        self.finished = true;
        info!(unit = %ctx.identity(), layer = %self.layer, "worker completed");
        let _ = self
            .notice
            .send(WorkerNotice::Completed {
                worker: ctx.identity().clone(),
            })
            .await;
    }

    fn pause_self(&mut self, ctx: &UnitContext) {
        self.paused = true;
        ctx.set_backpressure(true);
        if let Some(strategy) = self.strategy.as_mut() {
            strategy.set_pause_flag(true);
        }
    }

    async fn resume_self(&mut self, ctx: &UnitContext) {
        self.paused = false;
        ctx.set_backpressure(false);
        if let Some(strategy) = self.strategy.as_mut() {
            if let Err(e) = strategy.resume_sending(ctx.identity()).await {
                warn!(unit = %ctx.identity(), error = %e, "resume flush failed");
            }
        }
        let deferred = std::mem::take(&mut self.deferred);
        for msg in deferred {
            self.on_payload(ctx, msg).await;
        }
    }

    /// Returns `true` when the event loop should exit.
    async fn on_control(&mut self, ctx: &UnitContext, control: ControlEvent) -> bool {
        match control {
            ControlEvent::InstallSendStrategy { strategy, ack } => {
                self.strategy = Some(strategy);
                let _ = ack.send(());
            }
            ControlEvent::AddExpectedUpstream { count, ack } => {
                self.expected_upstream += count;
                let _ = ack.send(());
            }
            ControlEvent::Start => {
                // Processor workers are input-driven; nothing to kick off.
            }
            ControlEvent::Pause { ack } => {
                self.pause_self(ctx);
                let _ = ack.send(());
            }
            ControlEvent::Resume { ack } => {
                self.resume_self(ctx).await;
                let _ = ack.send(());
            }
            ControlEvent::AssignBreakpoint { breakpoint, ack } => {
                debug!(unit = %ctx.identity(), breakpoint = %breakpoint.id(), version = breakpoint.version(), "breakpoint assigned");
                self.breakpoint = Some(breakpoint);
                let _ = ack.send(());
            }
            ControlEvent::RemoveBreakpoint { id, ack } => {
                if self.breakpoint.as_ref().map(|b| b.id()) == Some(id.as_str()) {
                    self.breakpoint = None;
                }
                let _ = ack.send(());
            }
            ControlEvent::QueryBreakpoint { id, reply } => {
                let state = self
                    .breakpoint
                    .as_mut()
                    .filter(|b| b.id() == id)
                    .map(|b| {
                        b.mark_reported();
                        b.snapshot()
                    });
                let _ = reply.send(state);
            }
            ControlEvent::Deactivate { ack } => {
                self.processor.dispose();
                let _ = ack.send(());
                return true;
            }
        }
        false
    }
}

/// Source-driven worker: pulls batches from its producer once started.
pub struct ProducerWorker {
    producer: Box<dyn TupleProducer>,
    strategy: Option<Box<dyn SendStrategy>>,
    pull_batch: usize,
    breakpoint: Option<LocalBreakpoint>,
    running: bool,
    paused: bool,
    finished: bool,
    layer: String,
    notice: mpsc::Sender<WorkerNotice>,
}

impl ProducerWorker {
    pub fn new(
        producer: Box<dyn TupleProducer>,
        layer: impl Into<String>,
        notice: mpsc::Sender<WorkerNotice>,
        pull_batch: usize,
    ) -> Self {
        Self {
            producer,
            strategy: None,
            pull_batch: pull_batch.max(1),
            breakpoint: None,
            running: false,
            paused: false,
            finished: false,
            layer: layer.into(),
            notice,
        }
    }

    /// Event-loop body handed to cluster activation.
    ///
    /// Control events are always preferred; between events the worker takes
    /// one production step whenever it is started, unpaused, and unfinished.
    pub async fn run(mut self, ctx: UnitContext, mut rx: mpsc::Receiver<WorkerEvent>) {
        if let Err(e) = self.producer.open().await {
            error!(unit = %ctx.identity(), error = %e, "producer open failed");
            return;
        }
        let workflow = ctx.identity().workflow.to_string();
        global_metrics().worker_started(&workflow);
        debug!(unit = %ctx.identity(), location = %ctx.location(), "producer worker started");

        loop {
            if self.running && !self.paused && !self.finished {
                tokio::select! {
                    biased;
                    event = rx.recv() => match event {
                        Some(e) => {
                            if self.on_event(&ctx, e).await {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = std::future::ready(()) => self.produce_step(&ctx).await,
                }
            } else {
                match rx.recv().await {
                    Some(e) => {
                        if self.on_event(&ctx, e).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        global_metrics().worker_stopped(&workflow);
        debug!(unit = %ctx.identity(), "producer worker stopped");
    }

    async fn produce_step(&mut self, ctx: &UnitContext) {
        match self.producer.next_batch(self.pull_batch) {
            Ok(Some(batch)) => {
                global_metrics().record_tuples_out(
                    &ctx.identity().workflow.to_string(),
                    &self.layer,
                    batch.len() as u64,
                );

                let mut triggered: Option<LocalBreakpointState> = None;
                if let Some(bp) = self.breakpoint.as_mut() {
                    for tuple in &batch {
                        bp.accept(tuple);
                        if bp.is_triggered() && bp.is_dirty() {
                            bp.mark_reported();
                            triggered = Some(bp.snapshot());
                        }
                    }
                }

                if let Some(strategy) = self.strategy.as_mut() {
                    if let Err(e) = strategy.enqueue(batch) {
                        warn!(unit = %ctx.identity(), error = %e, "output enqueue failed");
                    } else if let Err(e) = strategy.send_batched(ctx.identity()).await {
                        warn!(unit = %ctx.identity(), error = %e, "batched send failed");
                    }
                }

                if let Some(state) = triggered {
                    self.pause_self(ctx);
                    info!(unit = %ctx.identity(), breakpoint = %state.id, "local breakpoint triggered");
                    let _ = self
                        .notice
                        .send(WorkerNotice::BreakpointTriggered {
                            worker: ctx.identity().clone(),
                            state,
                        })
                        .await;
                }
            }
            Ok(None) => self.finish(ctx).await,
            Err(e) => {
                warn!(unit = %ctx.identity(), error = %e, "producer pull failed; ending stream");
                self.finish(ctx).await;
            }
        }
    }

    async fn finish(&mut self, ctx: &UnitContext) {
        if self.finished {
            return;
        }
        self.producer.close();
        if let Some(strategy) = self.strategy.as_mut() {
            if let Err(e) = strategy.send_end(ctx.identity()).await {
                warn!(unit = %ctx.identity(), error = %e, "end-of-stream send failed");
            }
        }
        self.finished = true;
        self.running = false;
        info!(unit = %ctx.identity(), layer = %self.layer, "worker completed");
        let _ = self
            .notice
            .send(WorkerNotice::Completed {
                worker: ctx.identity().clone(),
            })
            .await;
    }

    fn pause_self(&mut self, ctx: &UnitContext) {
        self.paused = true;
        ctx.set_backpressure(true);
        if let Some(strategy) = self.strategy.as_mut() {
            strategy.set_pause_flag(true);
        }
    }

    /// Returns `true` when the event loop should exit.
    async fn on_event(&mut self, ctx: &UnitContext, event: WorkerEvent) -> bool {
        let control = match event {
            WorkerEvent::Payload(msg) => {
                debug!(unit = %ctx.identity(), sender = %msg.sender, "producer ignores inbound payload");
                return false;
            }
            WorkerEvent::Control(control) => control,
        };
        match control {
            ControlEvent::InstallSendStrategy { strategy, ack } => {
                self.strategy = Some(strategy);
                let _ = ack.send(());
            }
            ControlEvent::AddExpectedUpstream { count, ack } => {
                debug!(unit = %ctx.identity(), count, "producer has no upstream; expectation ignored");
                let _ = ack.send(());
            }
            ControlEvent::Start => {
                self.running = true;
            }
            ControlEvent::Pause { ack } => {
                self.pause_self(ctx);
                let _ = ack.send(());
            }
            ControlEvent::Resume { ack } => {
                self.paused = false;
                ctx.set_backpressure(false);
                if let Some(strategy) = self.strategy.as_mut() {
                    if let Err(e) = strategy.resume_sending(ctx.identity()).await {
                        warn!(unit = %ctx.identity(), error = %e, "resume flush failed");
                    }
                }
                let _ = ack.send(());
            }
            ControlEvent::AssignBreakpoint { breakpoint, ack } => {
                debug!(unit = %ctx.identity(), breakpoint = %breakpoint.id(), version = breakpoint.version(), "breakpoint assigned");
                self.breakpoint = Some(breakpoint);
                let _ = ack.send(());
            }
            ControlEvent::RemoveBreakpoint { id, ack } => {
                if self.breakpoint.as_ref().map(|b| b.id()) == Some(id.as_str()) {
                    self.breakpoint = None;
                }
                let _ = ack.send(());
            }
            ControlEvent::QueryBreakpoint { id, reply } => {
                let state = self
                    .breakpoint
                    .as_mut()
                    .filter(|b| b.id() == id)
                    .map(|b| {
                        b.mark_reported();
                        b.snapshot()
                    });
                let _ = reply.send(state);
            }
            ControlEvent::Deactivate { ack } => {
                self.producer.close();
                let _ = ack.send(());
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
