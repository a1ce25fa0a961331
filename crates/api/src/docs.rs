//! OpenAPI aggregation for the handful of routes annotated with
//! `#[utoipa::path(...)]`. `enforcement-core` carries no HTTP dependency, so
//! response bodies are documented in prose rather than as typed schemas —
//! see the individual handler annotations.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::check,
        crate::routes::gate::handle_generic,
        crate::routes::terraform::handle_preflight,
        crate::routes::policies::create,
    ),
    tags(
        (name = "health", description = "Liveness and scrape endpoints"),
        (name = "gate", description = "Enforcement gate decision adapters"),
        (name = "policies", description = "Policy document administration"),
    )
)]
pub struct ApiDoc;
