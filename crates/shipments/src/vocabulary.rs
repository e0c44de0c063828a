//! Per-provider raw status vocabularies.
//!
//! Couriers report progress in their own words. Each provider has a static
//! table mapping its raw codes onto [`CanonicalStatus`]; anything missing from
//! the table translates to `None` and must not mutate shipment state.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use vayva_core::DomainError;

use crate::status::CanonicalStatus::{self, *};

/// Integrated delivery providers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Kwik Delivery (SCREAMING_CASE task statuses).
    Kwik,
    /// Generic courier integration speaking snake_case statuses.
    Courier,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Kwik, Provider::Courier];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Kwik => "kwik",
            Provider::Courier => "courier",
        }
    }

    fn vocabulary(&self) -> &'static [(&'static str, CanonicalStatus)] {
        match self {
            Provider::Kwik => KWIK_VOCABULARY,
            Provider::Courier => COURIER_VOCABULARY,
        }
    }

    fn normalize(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        match self {
            Provider::Kwik => trimmed.to_ascii_uppercase().replace([' ', '-'], "_"),
            Provider::Courier => trimmed.to_ascii_lowercase().replace([' ', '-'], "_"),
        }
    }
}

impl core::fmt::Display for Provider {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| DomainError::validation(format!("unknown provider '{s}'")))
    }
}

const KWIK_VOCABULARY: &[(&str, CanonicalStatus)] = &[
    ("UPCOMING", Requested),
    ("PENDING", Requested),
    ("ACCEPTED", Accepted),
    ("ASSIGNED", Accepted),
    ("ARRIVED", Accepted),
    ("PICKED_UP", PickedUp),
    ("STARTED", InTransit),
    ("ENDED", Delivered),
    ("COMPLETED", Delivered),
    ("FAILED", Failed),
    ("CANCELLED", Canceled),
    ("CANCELED", Canceled),
    ("DELETED", Canceled),
];

const COURIER_VOCABULARY: &[(&str, CanonicalStatus)] = &[
    ("requested", Requested),
    ("created", Requested),
    ("pending", Requested),
    ("accepted", Accepted),
    ("assigned", Accepted),
    ("picked_up", PickedUp),
    ("collected", PickedUp),
    ("in_transit", InTransit),
    ("out_for_delivery", InTransit),
    ("delivered", Delivered),
    ("failed", Failed),
    ("returned", Failed),
    ("undeliverable", Failed),
    ("canceled", Canceled),
    ("cancelled", Canceled),
];

/// Normalize a provider's raw status code into the canonical lifecycle.
///
/// Returns `None` for codes the provider table does not know.
pub fn translate(provider: Provider, raw: &str) -> Option<CanonicalStatus> {
    let normalized = provider.normalize(raw);
    provider
        .vocabulary()
        .iter()
        .find(|(code, _)| *code == normalized)
        .map(|(_, status)| *status)
}
