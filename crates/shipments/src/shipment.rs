use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vayva_core::{DomainError, ShipmentId, TenantId};

use crate::status::CanonicalStatus;
use crate::transitions::{WebhookMove, can_manual_transition, classify_webhook};
use crate::vocabulary::Provider;

/// Courier/rider metadata reported by providers or operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourierInfo {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub tracking_url: Option<String>,
}

impl CourierInfo {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.phone.is_none() && self.tracking_url.is_none()
    }

    /// Copy over every field `update` supplies. Absent fields keep their value.
    ///
    /// Returns `true` if anything changed.
    pub fn merge_from(&mut self, update: &CourierInfo) -> bool {
        let mut changed = false;
        for (slot, incoming) in [
            (&mut self.name, &update.name),
            (&mut self.phone, &update.phone),
            (&mut self.tracking_url, &update.tracking_url),
        ] {
            if let Some(value) = incoming.as_ref().filter(|v| !v.trim().is_empty()) {
                if slot.as_deref() != Some(value.as_str()) {
                    *slot = Some(value.clone());
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Origin of a lifecycle change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Webhook,
    Manual,
    System,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Webhook => "webhook",
            EventSource::Manual => "manual",
            EventSource::System => "system",
        }
    }
}

impl core::str::FromStr for EventSource {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(EventSource::Webhook),
            "manual" => Ok(EventSource::Manual),
            "system" => Ok(EventSource::System),
            other => Err(DomainError::validation(format!("unknown event source '{other}'"))),
        }
    }
}

/// One immutable entry of a shipment's delivery history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub status: CanonicalStatus,
    pub raw_status: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub note: Option<String>,
    pub source: EventSource,
}

/// A requested status change, before it is checked against the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub to: CanonicalStatus,
    pub raw_status: Option<String>,
    pub note: Option<String>,
    pub courier: Option<CourierInfo>,
    pub tracking_code: Option<String>,
    pub source: EventSource,
    pub occurred_at: DateTime<Utc>,
}

impl Transition {
    pub fn webhook(to: CanonicalStatus, raw_status: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            to,
            raw_status: Some(raw_status.into()),
            note: None,
            courier: None,
            tracking_code: None,
            source: EventSource::Webhook,
            occurred_at,
        }
    }

    pub fn manual(to: CanonicalStatus, occurred_at: DateTime<Utc>) -> Self {
        Self {
            to,
            raw_status: None,
            note: None,
            courier: None,
            tracking_code: None,
            source: EventSource::Manual,
            occurred_at,
        }
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn with_courier(mut self, courier: Option<CourierInfo>) -> Self {
        self.courier = courier.filter(|c| !c.is_empty());
        self
    }

    pub fn with_tracking_code(mut self, tracking_code: Option<String>) -> Self {
        self.tracking_code = tracking_code.filter(|c| !c.trim().is_empty());
        self
    }
}

/// Aggregate root: Shipment.
///
/// `version` increments by one per applied transition and is the
/// compare-and-swap token used by stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shipment {
    pub id: ShipmentId,
    pub owner_id: Option<TenantId>,
    pub order_ref: String,
    pub provider: Provider,
    pub external_tracking_code: Option<String>,
    pub canonical_status: CanonicalStatus,
    pub provider_raw_status: Option<String>,
    pub courier: CourierInfo,
    pub version: u64,
    pub history: Vec<DeliveryEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Shipment {
    /// A freshly dispatched shipment, in `Requested` with one system event.
    pub fn requested(
        id: ShipmentId,
        owner_id: Option<TenantId>,
        order_ref: impl Into<String>,
        provider: Provider,
        external_tracking_code: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let order_ref = order_ref.into();
        if order_ref.trim().is_empty() {
            return Err(DomainError::validation("order_ref cannot be empty"));
        }

        Ok(Self {
            id,
            owner_id,
            order_ref,
            provider,
            external_tracking_code: external_tracking_code.filter(|c| !c.trim().is_empty()),
            canonical_status: CanonicalStatus::Requested,
            provider_raw_status: None,
            courier: CourierInfo::default(),
            version: 1,
            history: vec![DeliveryEvent {
                status: CanonicalStatus::Requested,
                raw_status: None,
                occurred_at: now,
                note: None,
                source: EventSource::System,
            }],
            created_at: now,
            updated_at: now,
        })
    }

    pub fn status(&self) -> CanonicalStatus {
        self.canonical_status
    }

    pub fn is_terminal(&self) -> bool {
        self.canonical_status.is_terminal()
    }

    /// Decide what a webhook-reported status means for this shipment.
    pub fn decide_webhook(&self, to: CanonicalStatus) -> WebhookMove {
        classify_webhook(self.canonical_status, to)
    }

    /// Check an operator-requested move against the manual allow-list.
    pub fn check_manual(&self, to: CanonicalStatus) -> Result<(), DomainError> {
        if can_manual_transition(self.canonical_status, to) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(self.canonical_status, to))
        }
    }

    /// Evolve state by one transition and append exactly one history entry.
    ///
    /// Callers must have validated the move (`decide_webhook`/`check_manual`).
    pub fn apply_transition(&mut self, transition: &Transition) {
        self.canonical_status = transition.to;
        if transition.raw_status.is_some() {
            self.provider_raw_status = transition.raw_status.clone();
        }
        if let Some(courier) = &transition.courier {
            self.courier.merge_from(courier);
        }
        if let Some(code) = &transition.tracking_code {
            if self.external_tracking_code.is_none() {
                self.external_tracking_code = Some(code.clone());
            }
        }

        self.history.push(DeliveryEvent {
            status: transition.to,
            raw_status: transition.raw_status.clone(),
            occurred_at: transition.occurred_at,
            note: transition.note.clone(),
            source: transition.source,
        });
        self.updated_at = transition.occurred_at;
        self.version += 1;
    }

    pub fn last_event(&self) -> Option<&DeliveryEvent> {
        self.history.last()
    }
}
