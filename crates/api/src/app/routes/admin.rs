//! Operator endpoints for dead-lettered jobs.
//!
//! Dead letters are never retried automatically; replay hands the payload
//! back so the caller can re-enqueue it. `?scope=system` addresses entries of
//! ownerless system jobs such as the idempotency purge.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tracing::info;

use vayva_auth::Permission;
use vayva_core::TenantId;
use vayva_infra::jobs::{DeadLetterId, DeadLetterStatus};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::authz;
use crate::context::{PrincipalContext, TenantContext};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 200;

pub fn router() -> Router {
    Router::new()
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/:id/replay", post(replay_dead_letter))
        .route("/dead-letters/:id/discard", post(discard_dead_letter))
}

pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<dto::DeadLetterQuery>,
) -> Response {
    let owner = match resolve_owner(
        &tenant,
        &principal,
        query.scope.as_deref(),
        &Permission::DEAD_LETTERS_READ,
    ) {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };

    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match DeadLetterStatus::parse(raw) {
            Some(s) => Some(s),
            None => {
                return errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_status",
                    "status must be one of: dead, replayed, discarded",
                );
            }
        },
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    match services.list_dead_letters(owner, status, limit).await {
        Ok(items) => {
            let items = items.iter().map(dto::dead_letter_to_json).collect::<Vec<_>>();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::dead_letter_error_to_response(e),
    }
}

pub async fn replay_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Query(query): Query<dto::DeadLetterScopeQuery>,
) -> Response {
    let owner = match resolve_owner(
        &tenant,
        &principal,
        query.scope.as_deref(),
        &Permission::DEAD_LETTERS_MANAGE,
    ) {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.replay_dead_letter(owner, id).await {
        Ok(entry) => {
            info!(dead_letter_id = %id, user_id = %principal.user_id(), "dead letter replay requested");
            (StatusCode::OK, Json(dto::dead_letter_to_json(&entry))).into_response()
        }
        Err(e) => errors::dead_letter_error_to_response(e),
    }
}

pub async fn discard_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Query(query): Query<dto::DeadLetterScopeQuery>,
) -> Response {
    let owner = match resolve_owner(
        &tenant,
        &principal,
        query.scope.as_deref(),
        &Permission::DEAD_LETTERS_MANAGE,
    ) {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.discard_dead_letter(owner, id).await {
        Ok(entry) => (StatusCode::OK, Json(dto::dead_letter_to_json(&entry))).into_response(),
        Err(e) => errors::dead_letter_error_to_response(e),
    }
}

/// The owner whose entries the request addresses. `None` is the system scope,
/// which takes a permission only admins hold.
fn resolve_owner(
    tenant: &TenantContext,
    principal: &PrincipalContext,
    scope: Option<&str>,
    permission: &Permission,
) -> Result<Option<TenantId>, Response> {
    match scope {
        None | Some("tenant") => {
            authz::require(tenant, principal, permission)?;
            Ok(Some(tenant.tenant_id()))
        }
        Some("system") => {
            authz::require(tenant, principal, &Permission::SYSTEM_JOBS_MANAGE)?;
            Ok(None)
        }
        Some(_) => Err(errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_scope",
            "scope must be one of: tenant, system",
        )),
    }
}

fn parse_id(raw: &str) -> Result<DeadLetterId, Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid dead letter id"))
}
