//! API-side authorization guard.
//!
//! Checks run in handlers before any service call, keeping the reliability
//! components auth-agnostic.

use axum::http::StatusCode;
use axum::response::Response;

use vayva_auth::{AuthzError, Permission, authorize, authorize_owned};
use vayva_core::TenantId;

use crate::app::errors::json_error;
use crate::context::{PrincipalContext, TenantContext};

/// Require `permission` within the caller's tenant.
pub fn require(
    tenant: &TenantContext,
    principal: &PrincipalContext,
    permission: &Permission,
) -> Result<(), Response> {
    authorize(&principal.principal(tenant), permission).map_err(authz_error_to_response)
}

/// Require `permission` on a resource owned by `owner`.
///
/// Resources of other tenants (or with no owner) are reported as missing.
pub fn require_owned(
    tenant: &TenantContext,
    principal: &PrincipalContext,
    owner: Option<TenantId>,
    permission: &Permission,
) -> Result<(), Response> {
    let Some(owner) = owner else {
        return Err(authz_error_to_response(AuthzError::TenantMismatch));
    };
    authorize_owned(&principal.principal(tenant), owner, permission).map_err(authz_error_to_response)
}

fn authz_error_to_response(err: AuthzError) -> Response {
    match err {
        AuthzError::TenantMismatch => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        AuthzError::Forbidden(_) => json_error(StatusCode::FORBIDDEN, "forbidden", err.to_string()),
    }
}
