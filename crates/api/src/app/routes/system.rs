use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::services::AppServices;
use crate::context::{PrincipalContext, TenantContext};

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "store": services.backend_name(),
        })),
    )
}

pub async fn whoami(
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "tenant_id": tenant.tenant_id().to_string(),
        "principal_id": principal.user_id().to_string(),
        "roles": principal.roles().iter().map(|r| r.as_str()).collect::<Vec<_>>(),
        "permissions": principal.permissions().iter().map(|p| p.as_str()).collect::<Vec<_>>(),
    }))
}
