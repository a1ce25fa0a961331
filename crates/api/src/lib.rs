//! `enforcement-api` — the Enforcement Control Plane's HTTP surface.
//!
//! Thin axum layer over `enforcement-core`: request parsing/validation,
//! Postgres-backed collaborator adapters the core deliberately leaves
//! external, Prometheus metrics, structured logging, and the gate protocol
//! adapters (Terraform preflight, Kubernetes AdmissionReview, CloudEvents,
//! generic). No domain logic lives here — it all belongs to
//! `enforcement-core` and `enforcement-export`.

pub mod adapters;
pub mod docs;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;
pub mod state;
pub mod telemetry;

pub use error::ApiError;
pub use state::AppState;
