//! Enforcement Control Plane API server binary.

use std::process;
use std::sync::Arc;

use enforcement_api::{server::ServerConfig, telemetry, AppState};
use enforcement_core::config::EnforcementConfig;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    telemetry::init();

    info!("starting enforcement-api");

    let config = match EnforcementConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            process::exit(1);
        }
    };

    let state = match AppState::build(config).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("failed to build application state: {e}");
            process::exit(1);
        }
    };

    let server_config = ServerConfig::default();
    let server = enforcement_api::server::Server::new(server_config, state);

    if let Err(e) = server.start().await {
        error!("server error: {e}");
        process::exit(1);
    }
}
