use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Extension, Path, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tracing::{info, warn};

use vayva_auth::Permission;
use vayva_core::ShipmentId;
use vayva_infra::idempotency::{IdempotencyKey, LockOutcome, StoredResponse};
use vayva_infra::webhooks::StatusUpdate;
use vayva_shipments::{CanonicalStatus, Provider};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::authz;
use crate::context::{PrincipalContext, TenantContext};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

const CREATE_SCOPE: &str = "shipments.create";
const MAX_KEY_LEN: usize = 255;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_shipment))
        .route("/:id", get(get_shipment))
        .route("/:id/status", post(transition_shipment))
}

pub async fn create_shipment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    headers: HeaderMap,
    body: Result<Json<dto::CreateShipmentRequest>, JsonRejection>,
) -> Response {
    if let Err(resp) = authz::require(&tenant, &principal, &Permission::SHIPMENTS_CREATE) {
        return resp;
    }

    let key = match idempotency_key(&headers) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text());
        }
    };

    // Keys are namespaced per tenant so merchants cannot collide.
    let key = IdempotencyKey::new(format!("{CREATE_SCOPE}:{}", tenant.tenant_id()), key);

    match services.lock_key(&key, tenant.tenant_id(), &body).await {
        Ok(LockOutcome::Acquired) => {}
        Ok(LockOutcome::Replay(stored)) => {
            info!(key = %key, "replaying stored response");
            return replay_response(stored);
        }
        Err(e) => return errors::idempotency_error_to_response(e),
    }

    let (status, payload) = match execute_create(&services, &tenant, &body).await {
        Ok(created) => created,
        Err((reason, resp)) => {
            if let Err(e) = services.fail_key(&key, &reason).await {
                warn!(key = %key, error = %e, "failed to release idempotency key");
            }
            return resp;
        }
    };

    let bytes = payload.to_string().into_bytes();
    if let Err(e) = services
        .complete_key(&key, StoredResponse::new(status.as_u16(), bytes.clone()))
        .await
    {
        warn!(key = %key, error = %e, "failed to store idempotent response");
    }

    json_bytes_response(status, bytes)
}

async fn execute_create(
    services: &AppServices,
    tenant: &TenantContext,
    body: &dto::CreateShipmentRequest,
) -> Result<(StatusCode, serde_json::Value), (String, Response)> {
    let provider: Provider = body.provider.parse().map_err(|e: vayva_core::DomainError| {
        let msg = e.to_string();
        (
            msg.clone(),
            errors::json_error(StatusCode::BAD_REQUEST, "invalid_provider", msg),
        )
    })?;

    let shipment = services
        .create_shipment(
            tenant.tenant_id(),
            &body.order_ref,
            provider,
            body.tracking_code.clone(),
        )
        .await
        .map_err(|e| (e.to_string(), errors::reconcile_error_to_response(e)))?;

    Ok((StatusCode::CREATED, dto::shipment_to_json(&shipment)))
}

pub async fn get_shipment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> Response {
    let id: ShipmentId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid shipment id"),
    };

    let shipment = match services.get_shipment(id).await {
        Ok(s) => s,
        Err(e) => return errors::reconcile_error_to_response(e),
    };
    if let Err(resp) =
        authz::require_owned(&tenant, &principal, shipment.owner_id, &Permission::SHIPMENTS_READ)
    {
        return resp;
    }

    (StatusCode::OK, Json(dto::shipment_to_json(&shipment))).into_response()
}

pub async fn transition_shipment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    body: Result<Json<dto::TransitionRequest>, JsonRejection>,
) -> Response {
    if let Err(resp) = authz::require(&tenant, &principal, &Permission::SHIPMENTS_TRANSITION) {
        return resp;
    }

    let id: ShipmentId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid shipment id"),
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text());
        }
    };
    let to: CanonicalStatus = match body.status.parse() {
        Ok(s) => s,
        Err(_) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "unknown_status",
                format!("unknown status '{}'", body.status),
            );
        }
    };

    // Ownership first so other tenants' shipments stay invisible.
    let current = match services.get_shipment(id).await {
        Ok(s) => s,
        Err(e) => return errors::reconcile_error_to_response(e),
    };
    if let Err(resp) = authz::require_owned(
        &tenant,
        &principal,
        current.owner_id,
        &Permission::SHIPMENTS_TRANSITION,
    ) {
        return resp;
    }

    let update = StatusUpdate {
        note: body.note,
        courier: body.courier.map(Into::into),
        ..StatusUpdate::default()
    };
    match services.transition_manual(id, to, update).await {
        Ok(shipment) => {
            info!(
                shipment_id = %id,
                user_id = %principal.user_id(),
                status = %to,
                "operator transition applied"
            );
            (StatusCode::OK, Json(dto::shipment_to_json(&shipment))).into_response()
        }
        Err(e) => errors::reconcile_error_to_response(e),
    }
}

fn idempotency_key(headers: &HeaderMap) -> Result<String, Response> {
    let raw = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            errors::json_error(
                StatusCode::BAD_REQUEST,
                "missing_idempotency_key",
                "Idempotency-Key header is required",
            )
        })?;

    if raw.len() > MAX_KEY_LEN {
        return Err(errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_idempotency_key",
            "Idempotency-Key is too long",
        ));
    }
    Ok(raw.to_string())
}

fn json_bytes_response(status: StatusCode, bytes: Vec<u8>) -> Response {
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn replay_response(stored: StoredResponse) -> Response {
    let status = StatusCode::from_u16(stored.status_code).unwrap_or(StatusCode::OK);
    let mut response = json_bytes_response(status, stored.body);
    response
        .headers_mut()
        .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    response
}
