//! Per-tenant and global sliding-window limiter for `/api/v1/enforcement/gate*`.
//!
//! Generalizes the plain IP-keyed limiter into two buckets: one keyed by
//! `tenant_id` (peeked out of the request body, since every gate adapter
//! carries it somewhere in the JSON payload) and one global bucket shared
//! across all tenants, gated by `ENFORCEMENT_GLOBAL_ABUSE_GUARD_ENABLED` and
//! sized by `ENFORCEMENT_GLOBAL_GATE_PER_MINUTE_CAP`. Either bucket tripping
//! returns `429` before the request reaches the decision engine.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tower::{Layer, Service};

use enforcement_core::config::EnforcementConfig;

/// Per-tenant cap. The global cap is externally configurable, but the
/// per-tenant bucket is fixed: generous enough to never bother a
/// well-behaved single tenant while still bounding one tenant's ability to
/// starve the lock/DB layer.
const TENANT_GATE_PER_MINUTE_CAP: usize = 600;

const MAX_PEEK_BODY_BYTES: usize = 64 * 1024;

#[derive(Serialize)]
struct ThrottledBody {
    error: String,
    reason_code: String,
}

fn throttled_response(reason: &str) -> Response {
    let body = ThrottledBody {
        error: format!("throttled: {reason}"),
        reason_code: "throttled".to_string(),
    };
    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}

/// Fixed-capacity sliding window keyed by an arbitrary string (tenant id, or
/// the constant `"*"` for the global bucket).
struct SlidingWindow {
    cap: usize,
    window: Duration,
    hits: HashMap<String, Vec<Instant>>,
}

impl SlidingWindow {
    fn new(cap: usize, window: Duration) -> Self {
        Self { cap, window, hits: HashMap::new() }
    }

    fn try_acquire(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let cutoff = now - self.window;
        let entry = self.hits.entry(key.to_string()).or_default();
        entry.retain(|t| *t > cutoff);
        if entry.len() >= self.cap {
            false
        } else {
            entry.push(now);
            true
        }
    }
}

/// Shared limiter state, cloned into every `GateRateLimitService`.
#[derive(Clone)]
pub struct GateRateLimiter {
    tenant_window: Arc<Mutex<SlidingWindow>>,
    global_window: Arc<Mutex<SlidingWindow>>,
    global_enabled: bool,
}

impl GateRateLimiter {
    pub fn new(config: &EnforcementConfig) -> Self {
        Self {
            tenant_window: Arc::new(Mutex::new(SlidingWindow::new(TENANT_GATE_PER_MINUTE_CAP, Duration::from_secs(60)))),
            global_window: Arc::new(Mutex::new(SlidingWindow::new(
                config.enforcement_global_gate_per_minute_cap as usize,
                Duration::from_secs(60),
            ))),
            global_enabled: config.enforcement_global_abuse_guard_enabled,
        }
    }

    fn check_global(&self) -> bool {
        if !self.global_enabled {
            return true;
        }
        self.global_window.lock().expect("global rate limiter mutex poisoned").try_acquire("*")
    }

    fn check_tenant(&self, tenant_id: &str) -> bool {
        self.tenant_window.lock().expect("tenant rate limiter mutex poisoned").try_acquire(tenant_id)
    }
}

/// Best-effort extraction of `tenant_id` from whichever JSON shape a gate
/// adapter accepts: the generic/terraform body's top-level field, the
/// CloudEvent envelope's nested `data.tenant_id`, or the admission review's
/// namespace/annotation (left to the handler; the limiter falls back to the
/// global bucket only when no tenant can be determined).
fn extract_tenant_id(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    if let Some(s) = value.get("tenant_id").and_then(|v| v.as_str()) {
        return Some(s.to_string());
    }
    if let Some(s) = value
        .get("data")
        .and_then(|d| d.get("tenant_id"))
        .and_then(|v| v.as_str())
    {
        return Some(s.to_string());
    }
    if let Some(s) = value
        .get("request")
        .and_then(|r| r.get("namespace"))
        .and_then(|v| v.as_str())
    {
        return Some(s.to_string());
    }
    None
}

#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: GateRateLimiter,
}

impl RateLimitLayer {
    pub fn new(limiter: GateRateLimiter) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = GateRateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GateRateLimitService { inner, limiter: self.limiter.clone() }
    }
}

#[derive(Clone)]
pub struct GateRateLimitService<S> {
    inner: S,
    limiter: GateRateLimiter,
}

impl<S> Service<Request> for GateRateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let mut inner = self.inner.clone();
        let limiter = self.limiter.clone();

        Box::pin(async move {
            if !limiter.check_global() {
                return Ok(throttled_response("global gate rate limit exceeded"));
            }

            let (parts, body) = req.into_parts();
            let bytes = match to_bytes(body, MAX_PEEK_BODY_BYTES).await {
                Ok(b) => b,
                Err(_) => {
                    let rebuilt = Request::from_parts(parts, Body::empty());
                    return inner.call(rebuilt).await;
                }
            };

            let tenant_id = extract_tenant_id(&bytes);
            if let Some(ref tenant_id) = tenant_id {
                if !limiter.check_tenant(tenant_id) {
                    return Ok(throttled_response("per-tenant gate rate limit exceeded"));
                }
            }

            let rebuilt = Request::from_parts(parts, Body::from(bytes));
            inner.call(rebuilt).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sliding_window_allows_up_to_cap() {
        let mut w = SlidingWindow::new(2, Duration::from_secs(60));
        assert!(w.try_acquire("tenant-a"));
        assert!(w.try_acquire("tenant-a"));
        assert!(!w.try_acquire("tenant-a"));
    }

    #[test]
    fn sliding_window_keys_are_independent() {
        let mut w = SlidingWindow::new(1, Duration::from_secs(60));
        assert!(w.try_acquire("tenant-a"));
        assert!(w.try_acquire("tenant-b"));
        assert!(!w.try_acquire("tenant-a"));
    }

    #[test]
    fn extract_tenant_id_from_generic_body() {
        let body = br#"{"tenant_id":"t-1","action":"apply"}"#;
        assert_eq!(extract_tenant_id(body), Some("t-1".to_string()));
    }

    #[test]
    fn extract_tenant_id_from_cloud_event_envelope() {
        let body = br#"{"specversion":"1.0","data":{"tenant_id":"t-2"}}"#;
        assert_eq!(extract_tenant_id(body), Some("t-2".to_string()));
    }

    #[test]
    fn extract_tenant_id_absent_returns_none() {
        let body = br#"{"foo":"bar"}"#;
        assert_eq!(extract_tenant_id(body), None);
    }
}
