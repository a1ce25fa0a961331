//! Standalone worker binary driving the periodic overdue-reservation sweep.
//! Runs independently of the API process so reconciliation keeps progressing
//! even if the HTTP surface is scaled to zero.

use std::process;
use std::time::Duration;

use chrono::Utc;
use enforcement_api::{telemetry, AppState};
use enforcement_core::config::EnforcementConfig;
use tracing::{error, info};

/// How far in the past a reservation's `expires_at` must be before the
/// worker will claim it; gives in-flight callers a short grace window past
/// the TTL before the sweep reclaims the hold.
const SWEEP_GRACE_SECONDS: i64 = 0;

/// Rows claimed per sweep iteration. Kept modest so one worker's sweep
/// transaction never holds `SKIP LOCKED` rows for long.
const SWEEP_BATCH_LIMIT: i64 = 200;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    telemetry::init();

    info!("starting enforcement-reconciler");

    let config = match EnforcementConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            process::exit(1);
        }
    };

    let state = match AppState::build(config).await {
        Ok(state) => state,
        Err(e) => {
            error!("failed to build application state: {e}");
            process::exit(1);
        }
    };

    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let older_than = Utc::now() - chrono::Duration::seconds(SWEEP_GRACE_SECONDS);
        match state.reconciliation_worker.run_overdue_sweep(older_than, SWEEP_BATCH_LIMIT).await {
            Ok(outcome) => {
                if !outcome.refunded.is_empty() || !outcome.failed.is_empty() {
                    info!(
                        refunded = outcome.refunded.len(),
                        failed = outcome.failed.len(),
                        "overdue sweep processed reservations"
                    );
                }
            }
            Err(e) => error!("overdue sweep failed: {e}"),
        }
    }
}
