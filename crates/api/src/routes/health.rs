//! Liveness and Prometheus scrape endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::error::Result;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    database: &'static str,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Liveness + DB probe status"))
)]
pub async fn check(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>> {
    let database = match sqlx::query("select 1").execute(&state.pool).await {
        Ok(_) => "up",
        Err(e) => {
            tracing::warn!("health check database probe failed: {e}");
            "down"
        }
    };
    Ok(Json(HealthResponse { status: "ok", database }))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.export()
}
