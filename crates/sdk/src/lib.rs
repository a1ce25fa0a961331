//! Enforcement Control Plane Rust SDK
//!
//! Thin `reqwest` client for out-of-process callers of the gate HTTP API:
//! CI runners driving Terraform preflight, an external actions orchestrator
//! consuming approved decisions, and any other caller that only needs to
//! speak the gate's wire contract without depending on
//! `enforcement-core`/`enforcement-api` internals.

pub mod client;
pub mod error;
pub mod types;

pub use client::EnforcementClient;
pub use error::{Result, SdkError};
