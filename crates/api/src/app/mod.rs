//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store selection and the reliability components
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use vayva_auth::Hs256JwtValidator;
use vayva_infra::config::AppConfig;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub async fn build_app(config: &AppConfig) -> anyhow::Result<Router> {
    let services = Arc::new(services::build_services(config).await?);
    Ok(build_router(services, &config.jwt_secret))
}

/// Router over already-built services.
pub fn build_router(services: Arc<AppServices>, jwt_secret: &str) -> Router {
    let jwt = Arc::new(Hs256JwtValidator::new(jwt_secret.as_bytes().to_vec()));
    let auth = middleware::OperatorAuth { jwt };

    let protected = routes::router().layer(axum::middleware::from_fn_with_state(
        auth,
        middleware::authenticate_operator,
    ));

    Router::new()
        .merge(routes::public_router())
        .merge(protected)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
