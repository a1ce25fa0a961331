//! External collaborator: tenant -> tier lookup, upstream of tier resolution.
//!
//! The core only specifies the `TenantDirectory` trait and the cache in
//! front of it; this mirrors `tenants` (migration 0002), the local record of
//! whatever plan/billing system assigns tiers.

use async_trait::async_trait;
use enforcement_core::tenant::{TenantDirectory, Tier};
use sqlx::{PgPool, Row};

pub struct PostgresTenantDirectory {
    pool: PgPool,
}

impl PostgresTenantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_tier(raw: &str) -> Option<Tier> {
    match raw {
        "FREE" => Some(Tier::Free),
        "STARTER" => Some(Tier::Starter),
        "GROWTH" => Some(Tier::Growth),
        "PRO" => Some(Tier::Pro),
        "ENTERPRISE" => Some(Tier::Enterprise),
        _ => None,
    }
}

#[async_trait]
impl TenantDirectory for PostgresTenantDirectory {
    async fn lookup_tier(&self, tenant_id: &str) -> anyhow::Result<Option<Tier>> {
        let row = sqlx::query("select tier from tenants where tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|row| parse_tier(row.get::<String, _>("tier").as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_tiers() {
        assert_eq!(parse_tier("ENTERPRISE"), Some(Tier::Enterprise));
        assert_eq!(parse_tier("unknown"), None);
    }
}
