//! Tier & Entitlement Resolver.
//!
//! Tenants and their plan tier live in an external tenant directory; this
//! module only owns the bounded, TTL'd, concurrency-safe read-through cache
//! in front of it. The contract is a single synchronous resolution path —
//! no awaitable-vs-sync branching.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

const CACHE_TTL: Duration = Duration::from_secs(60);
const CACHE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Free,
    Starter,
    Growth,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "FREE",
            Tier::Starter => "STARTER",
            Tier::Growth => "GROWTH",
            Tier::Pro => "PRO",
            Tier::Enterprise => "ENTERPRISE",
        }
    }
}

/// External tenant directory: tenant -> tier resolution. Implemented by a
/// collaborator outside the enforcement core (billing/plan service).
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn lookup_tier(&self, tenant_id: &str) -> anyhow::Result<Option<Tier>>;
}

struct CacheEntry {
    tier: Tier,
    inserted_at: Instant,
    last_used: Instant,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Bounded TTL + LRU cache in front of a [`TenantDirectory`].
///
/// - TTL: 60s per entry.
/// - Capacity: 4096 entries; least-recently-used eviction when exceeded.
/// - Unknown tenants resolve to `FREE` and increment a warning counter.
pub struct TierResolver {
    directory: Box<dyn TenantDirectory>,
    state: Mutex<CacheState>,
}

impl TierResolver {
    pub fn new(directory: Box<dyn TenantDirectory>) -> Self {
        Self {
            directory,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    /// Resolves a tenant's tier, consulting the cache first.
    pub async fn get_tenant_tier(&self, tenant_id: &str) -> Tier {
        let now = Instant::now();
        if let Some(tier) = self.cache_lookup(tenant_id, now) {
            return tier;
        }

        let resolved = match self.directory.lookup_tier(tenant_id).await {
            Ok(Some(tier)) => tier,
            Ok(None) => {
                warn!(tenant_id, "unknown tenant, defaulting to FREE tier");
                Tier::Free
            }
            Err(err) => {
                warn!(tenant_id, error = %err, "tenant directory lookup failed, defaulting to FREE tier");
                Tier::Free
            }
        };

        self.cache_insert(tenant_id, resolved, now);
        resolved
    }

    /// Invalidates a tenant's cache entry. Called after any plan sync.
    pub fn clear_tenant_tier_cache(&self, tenant_id: &str) {
        let mut state = self.state.lock().expect("tier cache lock poisoned");
        state.entries.remove(tenant_id);
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().expect("tier cache lock poisoned");
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            size: state.entries.len(),
        }
    }

    fn cache_lookup(&self, tenant_id: &str, now: Instant) -> Option<Tier> {
        let mut state = self.state.lock().expect("tier cache lock poisoned");
        let expired = state
            .entries
            .get(tenant_id)
            .map(|e| now.duration_since(e.inserted_at) >= CACHE_TTL)
            .unwrap_or(false);
        if expired {
            state.entries.remove(tenant_id);
        }
        if let Some(entry) = state.entries.get_mut(tenant_id) {
            entry.last_used = now;
            state.hits += 1;
            return Some(entry.tier);
        }
        state.misses += 1;
        None
    }

    fn cache_insert(&self, tenant_id: &str, tier: Tier, now: Instant) {
        let mut state = self.state.lock().expect("tier cache lock poisoned");
        if state.entries.len() >= CACHE_CAPACITY && !state.entries.contains_key(tenant_id) {
            if let Some(lru_key) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                state.entries.remove(&lru_key);
                state.evictions += 1;
            }
        }
        state.entries.insert(
            tenant_id.to_string(),
            CacheEntry {
                tier,
                inserted_at: now,
                last_used: now,
            },
        );
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeDirectory {
        calls: Arc<AtomicUsize>,
        tier: Option<Tier>,
    }

    #[async_trait]
    impl TenantDirectory for FakeDirectory {
        async fn lookup_tier(&self, _tenant_id: &str) -> anyhow::Result<Option<Tier>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.tier)
        }
    }

    #[tokio::test]
    async fn caches_repeated_lookups() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = TierResolver::new(Box::new(FakeDirectory {
            calls: calls.clone(),
            tier: Some(Tier::Growth),
        }));

        assert_eq!(resolver.get_tenant_tier("t1").await, Tier::Growth);
        assert_eq!(resolver.get_tenant_tier("t1").await, Tier::Growth);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.stats().hits, 1);
    }

    #[tokio::test]
    async fn unknown_tenant_defaults_to_free() {
        let resolver = TierResolver::new(Box::new(FakeDirectory {
            calls: Arc::new(AtomicUsize::new(0)),
            tier: None,
        }));
        assert_eq!(resolver.get_tenant_tier("ghost").await, Tier::Free);
    }

    #[tokio::test]
    async fn clear_cache_forces_refetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = TierResolver::new(Box::new(FakeDirectory {
            calls: calls.clone(),
            tier: Some(Tier::Pro),
        }));
        resolver.get_tenant_tier("t1").await;
        resolver.clear_tenant_tier_cache("t1");
        resolver.get_tenant_tier("t1").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
