use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    tuples_in: CounterVec,
    tuples_out: CounterVec,
    messages_sent: CounterVec,
    messages_dropped: CounterVec,
    send_retries: CounterVec,
    breakpoint_reports: CounterVec,
    active_workers: GaugeVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_tuples_in(&self, workflow_id: &str, layer: &str, tuples: u64) {
        self.inner
            .tuples_in
            .with_label_values(&[workflow_id, layer])
            .inc_by(tuples as f64);
    }

    pub fn record_tuples_out(&self, workflow_id: &str, layer: &str, tuples: u64) {
        self.inner
            .tuples_out
            .with_label_values(&[workflow_id, layer])
            .inc_by(tuples as f64);
    }

    pub fn record_message_sent(&self, workflow_id: &str, strategy: &str) {
        self.inner
            .messages_sent
            .with_label_values(&[workflow_id, strategy])
            .inc();
    }

    /// Dropped-after-retries delivery outcome, visible to hosts that want to
    /// escalate instead of silently losing data.
    pub fn record_message_dropped(&self, workflow_id: &str, strategy: &str) {
        self.inner
            .messages_dropped
            .with_label_values(&[workflow_id, strategy])
            .inc();
    }

    pub fn record_send_retry(&self, workflow_id: &str, strategy: &str) {
        self.inner
            .send_retries
            .with_label_values(&[workflow_id, strategy])
            .inc();
    }

    pub fn record_breakpoint_report(&self, workflow_id: &str, accepted: bool) {
        let accepted = if accepted { "true" } else { "false" };
        self.inner
            .breakpoint_reports
            .with_label_values(&[workflow_id, accepted])
            .inc();
    }

    pub fn worker_started(&self, workflow_id: &str) {
        self.inner
            .active_workers
            .with_label_values(&[workflow_id])
            .inc();
    }

    pub fn worker_stopped(&self, workflow_id: &str) {
        self.inner
            .active_workers
            .with_label_values(&[workflow_id])
            .dec();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let tuples_in = counter_vec(
            &registry,
            "flowmesh_tuples_in_total",
            "Input tuples processed per worker layer",
            &["workflow_id", "layer"],
        );
        let tuples_out = counter_vec(
            &registry,
            "flowmesh_tuples_out_total",
            "Output tuples produced per worker layer",
            &["workflow_id", "layer"],
        );
        let messages_sent = counter_vec(
            &registry,
            "flowmesh_messages_sent_total",
            "Payload messages delivered per send strategy",
            &["workflow_id", "strategy"],
        );
        let messages_dropped = counter_vec(
            &registry,
            "flowmesh_messages_dropped_total",
            "Payload messages dropped after exhausting delivery retries",
            &["workflow_id", "strategy"],
        );
        let send_retries = counter_vec(
            &registry,
            "flowmesh_send_retries_total",
            "Delivery retry attempts per send strategy",
            &["workflow_id", "strategy"],
        );
        let breakpoint_reports = counter_vec(
            &registry,
            "flowmesh_breakpoint_reports_total",
            "Local breakpoint reports received, by acceptance",
            &["workflow_id", "accepted"],
        );
        let active_workers = gauge_vec(
            &registry,
            "flowmesh_active_workers",
            "Worker units currently running per workflow",
            &["workflow_id"],
        );

        Self {
            registry,
            tuples_in,
            tuples_out,
            messages_sent,
            messages_dropped,
            send_retries,
            breakpoint_reports,
            active_workers,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
