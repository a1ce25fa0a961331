//! Policy document store.
//!
//! Policy documents are versioned append-only rows keyed by tenant (a
//! `"__global__"` sentinel tenant holds the fallback policy consulted when a
//! tenant has no tenant-specific override).

use sqlx::{PgPool, Row};

use crate::error::{CoreError, Result};
use crate::policy::document::{self, PolicyDocument};

pub const GLOBAL_TENANT: &str = "__global__";

#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_active(&self, tenant_id: &str) -> Result<PolicyDocument>;
    async fn put(&self, tenant_id: &str, raw_payload: &str) -> Result<(i64, String)>;
}

pub struct PostgresPolicyStore {
    pool: PgPool,
}

impl PostgresPolicyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl PolicyStore for PostgresPolicyStore {
    async fn get_active(&self, tenant_id: &str) -> Result<PolicyDocument> {
        let row = sqlx::query(
            r#"
            select canonical_payload, policy_version
            from policy_documents
            where tenant_id = $1
            order by policy_version desc
            limit 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None if tenant_id != GLOBAL_TENANT => {
                return self.get_active(GLOBAL_TENANT).await;
            }
            None => {
                return Err(CoreError::NotFound(
                    "no global policy document configured".to_string(),
                ))
            }
        };

        let canonical_payload: Vec<u8> = row.get("canonical_payload");
        let policy_version: i64 = row.get("policy_version");
        document::materialize(&canonical_payload, policy_version)
    }

    async fn put(&self, tenant_id: &str, raw_payload: &str) -> Result<(i64, String)> {
        let canonical = document::canonicalize(raw_payload)?;
        // Validate before persisting so bad payloads never become "active".
        let _ = document::materialize(&canonical, 0)?;
        let hash = document::sha256_hex(&canonical);

        let row = sqlx::query(
            r#"
            insert into policy_documents (tenant_id, policy_version, canonical_payload, sha256_hash)
            values (
                $1,
                coalesce((select max(policy_version) + 1 from policy_documents where tenant_id = $1), 1),
                $2,
                $3
            )
            returning policy_version
            "#,
        )
        .bind(tenant_id)
        .bind(&canonical)
        .bind(&hash)
        .fetch_one(&self.pool)
        .await?;

        let policy_version: i64 = row.get("policy_version");
        Ok((policy_version, hash))
    }
}
