//! Bearer-token authentication for operator routes.
//!
//! A valid token puts the caller's tenant and principal into the request
//! extensions; handlers never see unauthenticated requests.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::debug;

use vayva_auth::JwtValidator;

use crate::app::errors::json_error;
use crate::context::{PrincipalContext, TenantContext};

#[derive(Clone)]
pub struct OperatorAuth {
    pub jwt: Arc<dyn JwtValidator>,
}

/// Why a request carried no usable bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BearerError {
    Missing,
    NotAscii,
    WrongScheme,
    Empty,
}

impl BearerError {
    fn as_str(self) -> &'static str {
        match self {
            BearerError::Missing => "no authorization header",
            BearerError::NotAscii => "authorization header is not ascii",
            BearerError::WrongScheme => "authorization scheme is not bearer",
            BearerError::Empty => "empty bearer token",
        }
    }
}

pub async fn authenticate_operator(
    State(auth): State<OperatorAuth>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = match bearer_token(req.headers()) {
        Ok(token) => token,
        Err(reason) => {
            debug!(reason = reason.as_str(), "request without bearer token");
            return unauthorized();
        }
    };

    let claims = match auth.jwt.validate(token, Utc::now()) {
        Ok(claims) => claims,
        Err(e) => {
            debug!(error = %e, "rejected bearer token");
            return unauthorized();
        }
    };

    let extensions = req.extensions_mut();
    extensions.insert(TenantContext::new(claims.tenant_id));
    extensions.insert(PrincipalContext::new(claims.sub, claims.roles));
    next.run(req).await
}

fn unauthorized() -> Response {
    json_error(StatusCode::UNAUTHORIZED, "unauthorized", "a valid bearer token is required")
}

/// The token of an `Authorization: Bearer <token>` header. The scheme is
/// matched case-insensitively.
fn bearer_token(headers: &HeaderMap) -> Result<&str, BearerError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(BearerError::Missing)?
        .to_str()
        .map_err(|_| BearerError::NotAscii)?;

    let (scheme, token) = value.split_once(' ').ok_or(BearerError::WrongScheme)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(BearerError::WrongScheme);
    }

    match token.trim() {
        "" => Err(BearerError::Empty),
        token => Ok(token),
    }
}
