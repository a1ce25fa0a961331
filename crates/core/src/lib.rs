//! `enforcement-core` — the Enforcement Control Plane's decision engine.
//!
//! This crate has no HTTP surface. It owns the domain model (policy
//! documents, tenants, credit grants, decisions, approvals), the
//! entitlement waterfall, the reservation ledger, the immutable decision
//! ledger, the approval/token workflow, the reconciliation sweep, and the
//! fail-safe mode matrix. `enforcement-api` is the only crate that talks
//! HTTP; it depends on this one.

pub mod approval;
pub mod config;
pub mod context;
pub mod db;
pub mod decision;
pub mod error;
pub mod error_budget;
pub mod failsafe;
pub mod ledger;
pub mod metrics;
pub mod money;
pub mod policy;
pub mod reconcile;
pub mod tenant;
pub mod waterfall;

pub use config::EnforcementConfig;
pub use error::{CoreError, Result};
