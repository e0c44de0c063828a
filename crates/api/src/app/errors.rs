use axum::http::{HeaderValue, StatusCode, header::RETRY_AFTER};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use vayva_infra::idempotency::IdempotencyError;
use vayva_infra::jobs::DeadLetterError;
use vayva_infra::store::StoreError;
use vayva_infra::webhooks::{ReconcileError, SignatureError};

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn store_error_to_response(err: StoreError) -> Response {
    match err {
        StoreError::Concurrency(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::Duplicate(msg) => json_error(StatusCode::CONFLICT, "duplicate", msg),
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        other => {
            error!(error = %other, "store failure");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                "internal storage error",
            )
        }
    }
}

pub fn idempotency_error_to_response(err: IdempotencyError) -> Response {
    match err {
        IdempotencyError::InFlight { retry_after, .. } => {
            let mut response = json_error(
                StatusCode::CONFLICT,
                "request_in_progress",
                "a request with this idempotency key is still in progress",
            );
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
            response
        }
        IdempotencyError::Conflict { .. } => json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "idempotency_key_reused",
            "idempotency key was already used with a different request",
        ),
        IdempotencyError::Fingerprint(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_payload", msg),
        IdempotencyError::NotFound(_)
        | IdempotencyError::NotStarted { .. }
        | IdempotencyError::OutOfRange { .. } => {
            error!(error = %err, "idempotency record in unexpected state");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "idempotency_state",
                err.to_string(),
            )
        }
        IdempotencyError::Store(e) => store_error_to_response(e),
    }
}

pub fn reconcile_error_to_response(err: ReconcileError) -> Response {
    match err {
        ReconcileError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        ReconcileError::InvalidTransition { .. } => {
            json_error(StatusCode::BAD_REQUEST, "invalid_transition", err.to_string())
        }
        ReconcileError::Invalid(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        ReconcileError::Contention(_) => json_error(StatusCode::CONFLICT, "conflict", err.to_string()),
        ReconcileError::Store(e) => store_error_to_response(e),
    }
}

pub fn dead_letter_error_to_response(err: DeadLetterError) -> Response {
    match err {
        DeadLetterError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        DeadLetterError::NotDead { .. } => json_error(StatusCode::CONFLICT, "not_dead", err.to_string()),
        DeadLetterError::Store(e) => store_error_to_response(e),
    }
}

pub fn signature_error_to_response(err: SignatureError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::FORBIDDEN);
    let code = match err {
        SignatureError::Missing(_) => "missing_signature",
        SignatureError::Mismatch => "invalid_signature",
        SignatureError::NotConfigured(_) => "webhook_not_configured",
    };
    json_error(status, code, err.to_string())
}
