use axum::{Router, routing::get};

pub mod admin;
pub mod shipments;
pub mod system;
pub mod webhooks;

/// Router for all authenticated (tenant-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/shipments", shipments::router())
        .nest("/admin", admin::router())
}

/// Endpoints that authenticate some other way, or not at all.
pub fn public_router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .nest("/webhooks", webhooks::router())
}
