//! The metric names the decision engine, ledger, and reconciliation worker
//! emit through. The actual Prometheus exporter
//! lives in `enforcement-api`'s middleware; this module only defines the
//! sink trait and the label vocabulary so core stays free of an HTTP/metrics
//! dependency.

use async_trait::async_trait;

use crate::error_budget::BudgetWindow;

/// Outcome of a tenant+source reservation lock attempt, for
/// `gate_lock_events_total{outcome}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEventOutcome {
    Acquired,
    Contended,
    Timeout,
    NotAcquired,
}

impl LockEventOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acquired => "acquired",
            Self::Contended => "contended",
            Self::Timeout => "timeout",
            Self::NotAcquired => "not_acquired",
        }
    }
}

/// Trigger for a reservation reconciliation, for
/// `reservation_reconciliations_total{trigger,status}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileTrigger {
    Auto,
    Manual,
}

impl ReconcileTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

/// Sink for the gate's decision/latency/lock/throttle metrics. Implemented
/// by `enforcement-api` over a `prometheus`-style registry; tests use a
/// no-op or recording fake.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    fn record_gate_decision(&self, source: &str, status: &str, reason: &str);
    fn record_gate_latency_seconds(&self, source: &str, seconds: f64);
    fn record_lock_event(&self, outcome: LockEventOutcome);
    fn record_reconciliation(&self, trigger: ReconcileTrigger, status: &str);
    fn set_approval_queue_backlog(&self, count: i64);
    fn record_invariant_violation(&self, context: &str);
    fn set_error_budget_burn_ratio(&self, window: BudgetWindow, ratio: f64);
}

/// Discards every metric. Useful in tests and for components wired up
/// without a metrics backend configured.
pub struct NoopMetricsSink;

#[async_trait]
impl MetricsSink for NoopMetricsSink {
    fn record_gate_decision(&self, _source: &str, _status: &str, _reason: &str) {}
    fn record_gate_latency_seconds(&self, _source: &str, _seconds: f64) {}
    fn record_lock_event(&self, _outcome: LockEventOutcome) {}
    fn record_reconciliation(&self, _trigger: ReconcileTrigger, _status: &str) {}
    fn set_approval_queue_backlog(&self, _count: i64) {}
    fn record_invariant_violation(&self, _context: &str) {}
    fn set_error_budget_burn_ratio(&self, _window: BudgetWindow, _ratio: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_event_outcome_labels() {
        assert_eq!(LockEventOutcome::Acquired.as_str(), "acquired");
        assert_eq!(LockEventOutcome::NotAcquired.as_str(), "not_acquired");
    }
}
