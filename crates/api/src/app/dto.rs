use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use vayva_infra::jobs::DeadLetterEntry;
use vayva_infra::webhooks::StatusUpdate;
use vayva_shipments::{CourierInfo, DeliveryEvent, Shipment};

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /shipments`. Also the idempotency fingerprint input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateShipmentRequest {
    pub order_ref: String,
    pub provider: String,
    pub tracking_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CourierRequest {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub tracking_url: Option<String>,
}

impl From<CourierRequest> for CourierInfo {
    fn from(c: CourierRequest) -> Self {
        CourierInfo {
            name: c.name,
            phone: c.phone,
            tracking_url: c.tracking_url,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub status: String,
    pub note: Option<String>,
    pub courier: Option<CourierRequest>,
}

/// Provider webhook body. Kwik field names are accepted as aliases.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(alias = "unique_order_id", alias = "job_id")]
    pub tracking_code: String,
    #[serde(alias = "job_status")]
    pub status: String,
    pub note: Option<String>,
    pub courier: Option<CourierRequest>,
    #[serde(alias = "fleet_name")]
    pub courier_name: Option<String>,
    #[serde(alias = "fleet_phone")]
    pub courier_phone: Option<String>,
    #[serde(alias = "tracking_link")]
    pub tracking_url: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

impl WebhookPayload {
    pub fn status_update(self) -> StatusUpdate {
        let mut courier = CourierInfo {
            name: self.courier_name,
            phone: self.courier_phone,
            tracking_url: self.tracking_url,
        };
        if let Some(nested) = self.courier {
            courier.merge_from(&CourierInfo::from(nested));
        }
        StatusUpdate {
            note: self.note,
            courier: Some(courier),
            tracking_code: None,
            occurred_at: self.occurred_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    /// `tenant` (default) or `system`.
    pub scope: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterScopeQuery {
    pub scope: Option<String>,
}

// -------------------------
// Response mapping
// -------------------------

pub fn delivery_event_to_json(e: &DeliveryEvent) -> Value {
    json!({
        "status": e.status.as_str(),
        "raw_status": e.raw_status,
        "occurred_at": e.occurred_at.to_rfc3339(),
        "note": e.note,
        "source": e.source.as_str(),
    })
}

pub fn shipment_to_json(s: &Shipment) -> Value {
    json!({
        "id": s.id.to_string(),
        "order_ref": s.order_ref,
        "provider": s.provider.as_str(),
        "tracking_code": s.external_tracking_code,
        "status": s.canonical_status.as_str(),
        "provider_raw_status": s.provider_raw_status,
        "courier": {
            "name": s.courier.name,
            "phone": s.courier.phone,
            "tracking_url": s.courier.tracking_url,
        },
        "version": s.version,
        "history": s.history.iter().map(delivery_event_to_json).collect::<Vec<_>>(),
        "created_at": s.created_at.to_rfc3339(),
        "updated_at": s.updated_at.to_rfc3339(),
    })
}

pub fn dead_letter_to_json(d: &DeadLetterEntry) -> Value {
    json!({
        "id": d.id.to_string(),
        "job_type": d.job_type,
        "correlation_id": d.correlation_id.to_string(),
        "attempts": d.attempts,
        "payload": d.payload_snapshot,
        "last_error": d.last_error,
        "status": d.status.as_str(),
        "created_at": d.created_at.to_rfc3339(),
        "resolved_at": d.resolved_at.map(|t| t.to_rfc3339()),
    })
}
