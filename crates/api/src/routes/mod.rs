//! Route modules, one per gate protocol adapter plus the admin/read
//! surfaces. [`router`] assembles all of them under the authoritative
//! `/api/v1/enforcement` prefix.

pub mod approvals;
pub mod budgets;
pub mod cloud_event;
pub mod credits;
pub mod exports;
pub mod gate;
pub mod health;
pub mod k8s;
pub mod ledger;
pub mod policies;
pub mod reservations;
pub mod terraform;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use enforcement_core::metrics::MetricsSink;

use crate::middleware::RateLimitLayer;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let rate_limiter = crate::middleware::GateRateLimiter::new(&state.config);

    let gate_routes = Router::new()
        .route("/gate", post(gate::handle_generic))
        .route("/gate/terraform", post(terraform::handle_v1))
        .route("/gate/terraform/preflight", post(terraform::handle_preflight))
        .route("/gate/k8s/admission", post(k8s::handle_legacy))
        .route("/gate/k8s/admission/review", post(k8s::handle_admission_review))
        .route("/gate/cloud-event", post(cloud_event::handle))
        .layer(RateLimitLayer::new(rate_limiter));

    let admin_routes = Router::new()
        .route("/approvals/:id/approve", post(approvals::approve))
        .route("/approvals/:id/deny", post(approvals::deny))
        .route("/approvals/queue", get(approvals::queue))
        .route("/approvals/consume", post(approvals::consume))
        .route("/policies", post(policies::create).get(policies::list))
        .route("/budgets", post(budgets::create).get(budgets::list))
        .route("/credits", post(credits::create).get(credits::list))
        .route("/reservations/reconcile", post(reservations::reconcile))
        .route("/ledger", get(ledger::list))
        .route("/exports/parity", get(exports::parity))
        .route("/exports/archive", get(exports::archive));

    let enforcement = gate_routes.merge(admin_routes);

    Router::new()
        .route("/health", get(health::check))
        .route("/metrics", get(health::metrics))
        .nest("/api/v1/enforcement", enforcement)
        .with_state(state)
}

/// Records a high-severity metric and a dedicated audit log line for
/// invariant violations, per the error-handling design's requirement that
/// they "MUST also emit an audit event and a high-severity metric" in
/// addition to the 500 the caller sees. `context` should name the route and
/// operation, e.g. `"gate.terraform"` or `"reservations.reconcile"`.
pub(crate) fn audit_invariant_violation(state: &AppState, context: &str, err: &crate::error::ApiError) {
    if let crate::error::ApiError::Core(enforcement_core::CoreError::InvariantViolation(msg)) = err {
        state.metrics.record_invariant_violation(context);
        tracing::error!(target: "enforcement_audit", context, violation = %msg, "invariant violation");
    }
}
