//! Provider webhook intake.
//!
//! Signatures are checked on the raw body before anything is parsed or
//! looked up. Understood-but-ignored deliveries still answer 200 so providers
//! stop retrying them.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::json;
use tracing::{info, warn};

use vayva_infra::webhooks::{self, WebhookOutcome};
use vayva_shipments::Provider;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new().route("/:provider", post(receive_webhook))
}

pub async fn receive_webhook(
    Extension(services): Extension<Arc<AppServices>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let provider: Provider = match provider.parse() {
        Ok(p) => p,
        Err(_) => {
            return errors::json_error(StatusCode::NOT_FOUND, "unknown_provider", "unknown provider");
        }
    };

    let signature = headers
        .get(webhooks::signature_header(provider))
        .map(|v| v.as_bytes());
    if let Err(e) = webhooks::verify(provider, services.webhook_secrets(), signature, &body) {
        warn!(provider = %provider, error = %e, "rejected webhook");
        return errors::signature_error_to_response(e);
    }

    let payload: dto::WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", e.to_string());
        }
    };
    if payload.tracking_code.trim().is_empty() {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_body",
            "tracking_code is required",
        );
    }

    let tracking_code = payload.tracking_code.trim().to_string();
    let raw_status = payload.status.clone();
    let outcome = match services
        .apply_webhook(provider, &tracking_code, &raw_status, payload.status_update())
        .await
    {
        Ok(o) => o,
        Err(e) => return errors::reconcile_error_to_response(e),
    };

    let shipment_id = match &outcome {
        WebhookOutcome::Reconciled(applied) => Some(applied.shipment().id.to_string()),
        WebhookOutcome::UnknownStatus { .. } => None,
    };
    info!(
        provider = %provider,
        tracking_code = %tracking_code,
        raw_status = %raw_status,
        result = outcome.label(),
        "webhook processed"
    );

    (
        StatusCode::OK,
        Json(json!({
            "result": outcome.label(),
            "shipment_id": shipment_id,
        })),
    )
        .into_response()
}
