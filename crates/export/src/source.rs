//! Row shapes and the data-access trait the bundle builder reads through.
//!
//! `enforcement-export` never touches SQL directly — `enforcement-api` wires
//! a Postgres-backed [`ExportDataSource`] implementation over the ledger,
//! reservation, and approval tables the core domain crate owns, keeping this
//! crate's storage trait distinct from its consumer's connection pool.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DecisionRow {
    pub decision_id: Uuid,
    pub tenant_id: String,
    pub source: String,
    pub action: String,
    pub environment: String,
    pub status: String,
    pub reason_code: String,
    pub policy_version: i64,
    pub policy_document_sha256: String,
    pub computed_context_version: i32,
    pub computed_context_generated_at: DateTime<Utc>,
    pub month_start: NaiveDate,
    pub month_end: NaiveDate,
    pub data_source_mode: String,
}

#[derive(Debug, Clone)]
pub struct ApprovalRow {
    pub approval_id: Uuid,
    pub decision_id: Uuid,
    pub tenant_id: String,
    pub status: String,
    pub routing_rule_id: String,
    pub quorum_required: u8,
    pub quorum_count: u8,
    pub reviewer_id: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReservationRow {
    pub decision_id: Uuid,
    pub grant_id: Uuid,
    pub pool_type: String,
    pub amount_usd: Decimal,
    pub state: String,
}

#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub sequence: i64,
    pub decision_id: Uuid,
    pub status: String,
    pub recorded_at: DateTime<Utc>,
}

/// Read-only view over a tenant's decisions/approvals/reservations/ledger
/// for a time window, consulted only by [`crate::bundle::build_export_bundle`].
#[async_trait]
pub trait ExportDataSource: Send + Sync {
    async fn decisions(&self, tenant_id: &str, window: &Window) -> Result<Vec<DecisionRow>>;
    async fn approvals(&self, tenant_id: &str, window: &Window) -> Result<Vec<ApprovalRow>>;
    async fn reservations(&self, tenant_id: &str, window: &Window) -> Result<Vec<ReservationRow>>;
    async fn ledger(&self, tenant_id: &str, window: &Window) -> Result<Vec<LedgerRow>>;
}
