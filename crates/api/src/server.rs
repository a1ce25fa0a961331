//! Assembles the axum app: routes, Swagger UI, CORS, compression, tracing.
//! Rate limiting is applied inside [`routes::router`] directly on the gate
//! sub-router rather than globally here, since only `/gate/*` needs it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::docs::ApiDoc;
use crate::error::Result;
use crate::routes;
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("ENFORCEMENT_API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("ENFORCEMENT_API_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            enable_cors: true,
        }
    }
}

pub struct Server {
    config: ServerConfig,
    app: Router,
}

impl Server {
    pub fn new(config: ServerConfig, state: Arc<AppState>) -> Self {
        let app = Self::build_app(state, &config);
        Self { config, app }
    }

    fn build_app(state: Arc<AppState>, config: &ServerConfig) -> Router {
        let mut app = routes::router(state);

        let swagger = SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi());
        app = app.merge(swagger);

        if config.enable_cors {
            let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
            app = app.layer(cors);
        }

        app.layer(CompressionLayer::new()).layer(TraceLayer::new_for_http())
    }

    pub async fn start(self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| crate::error::ApiError::Internal(anyhow::anyhow!("invalid bind address: {e}")))?;

        info!("enforcement-api listening on http://{addr}");
        info!("swagger ui: http://{addr}/swagger-ui");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| crate::error::ApiError::Internal(anyhow::anyhow!("failed to bind {addr}: {e}")))?;

        axum::serve(listener, self.app)
            .await
            .map_err(|e| crate::error::ApiError::Internal(anyhow::anyhow!("server error: {e}")))?;

        Ok(())
    }

    #[cfg(test)]
    pub fn router(self) -> Router {
        self.app
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_server_config_has_sane_port() {
        std::env::remove_var("ENFORCEMENT_API_HOST");
        std::env::remove_var("ENFORCEMENT_API_PORT");
        let config = ServerConfig::default();
        assert!(config.enable_cors);
        assert_eq!(config.port, 8080);
    }
}
