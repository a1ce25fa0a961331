//! Prometheus-backed [`MetricsSink`] and the `/metrics` scrape endpoint.
//! The core crate stays free of a metrics dependency; this is the only
//! place `prometheus` is used, via its `Registry` + `TextEncoder` pair.

use async_trait::async_trait;
use enforcement_core::error_budget::BudgetWindow;
use enforcement_core::metrics::{LockEventOutcome, MetricsSink, ReconcileTrigger};
use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};

pub struct PrometheusMetricsSink {
    registry: Registry,
    gate_decisions_total: CounterVec,
    gate_latency_seconds: HistogramVec,
    gate_lock_events_total: CounterVec,
    reservation_reconciliations_total: CounterVec,
    approval_queue_backlog: Gauge,
    invariant_violations_total: CounterVec,
    error_budget_burn_ratio: GaugeVec,
}

impl PrometheusMetricsSink {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let gate_decisions_total = CounterVec::new(
            Opts::new("gate_decisions_total", "Gate decisions by source, status, reason"),
            &["source", "status", "reason"],
        )?;
        let gate_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new("gate_latency_seconds", "Gate evaluation latency"),
            &["source"],
        )?;
        let gate_lock_events_total = CounterVec::new(
            Opts::new("gate_lock_events_total", "Tenant+source reservation lock outcomes"),
            &["outcome"],
        )?;
        let reservation_reconciliations_total = CounterVec::new(
            Opts::new("reservation_reconciliations_total", "Reservation reconciliations by trigger and status"),
            &["trigger", "status"],
        )?;
        let approval_queue_backlog = Gauge::new("approval_queue_backlog", "Pending approval requests")?;
        let invariant_violations_total = CounterVec::new(
            Opts::new("invariant_violations_total", "Invariant violations by context"),
            &["context"],
        )?;
        let error_budget_burn_ratio = GaugeVec::new(
            Opts::new(
                "error_budget_burn_ratio",
                "Multi-window SLO error budget burn ratio (observed error rate / SLO budget), by window",
            ),
            &["window"],
        )?;

        registry.register(Box::new(gate_decisions_total.clone()))?;
        registry.register(Box::new(gate_latency_seconds.clone()))?;
        registry.register(Box::new(gate_lock_events_total.clone()))?;
        registry.register(Box::new(reservation_reconciliations_total.clone()))?;
        registry.register(Box::new(approval_queue_backlog.clone()))?;
        registry.register(Box::new(invariant_violations_total.clone()))?;
        registry.register(Box::new(error_budget_burn_ratio.clone()))?;

        Ok(Self {
            registry,
            gate_decisions_total,
            gate_latency_seconds,
            gate_lock_events_total,
            reservation_reconciliations_total,
            approval_queue_backlog,
            invariant_violations_total,
            error_budget_burn_ratio,
        })
    }

    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer).expect("prometheus text encoding never fails");
        String::from_utf8(buffer).expect("prometheus output is always valid utf-8")
    }
}

#[async_trait]
impl MetricsSink for PrometheusMetricsSink {
    fn record_gate_decision(&self, source: &str, status: &str, reason: &str) {
        self.gate_decisions_total.with_label_values(&[source, status, reason]).inc();
    }

    fn record_gate_latency_seconds(&self, source: &str, seconds: f64) {
        self.gate_latency_seconds.with_label_values(&[source]).observe(seconds);
    }

    fn record_lock_event(&self, outcome: LockEventOutcome) {
        self.gate_lock_events_total.with_label_values(&[outcome.as_str()]).inc();
    }

    fn record_reconciliation(&self, trigger: ReconcileTrigger, status: &str) {
        self.reservation_reconciliations_total
            .with_label_values(&[trigger.as_str(), status])
            .inc();
    }

    fn set_approval_queue_backlog(&self, count: i64) {
        self.approval_queue_backlog.set(count as f64);
    }

    fn record_invariant_violation(&self, context: &str) {
        self.invariant_violations_total.with_label_values(&[context]).inc();
    }

    fn set_error_budget_burn_ratio(&self, window: BudgetWindow, ratio: f64) {
        self.error_budget_burn_ratio.with_label_values(&[window.as_str()]).set(ratio);
    }
}
