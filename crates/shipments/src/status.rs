use core::str::FromStr;

use serde::{Deserialize, Serialize};

use vayva_core::DomainError;

/// The platform's normalized shipment lifecycle stage.
///
/// Forward order: `Requested → Accepted → PickedUp → InTransit → Delivered`.
/// `Failed` and `Canceled` are exits reachable from any non-terminal stage.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    Requested,
    Accepted,
    PickedUp,
    InTransit,
    Delivered,
    Failed,
    Canceled,
}

impl CanonicalStatus {
    pub const ALL: [CanonicalStatus; 7] = [
        CanonicalStatus::Requested,
        CanonicalStatus::Accepted,
        CanonicalStatus::PickedUp,
        CanonicalStatus::InTransit,
        CanonicalStatus::Delivered,
        CanonicalStatus::Failed,
        CanonicalStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalStatus::Requested => "requested",
            CanonicalStatus::Accepted => "accepted",
            CanonicalStatus::PickedUp => "picked_up",
            CanonicalStatus::InTransit => "in_transit",
            CanonicalStatus::Delivered => "delivered",
            CanonicalStatus::Failed => "failed",
            CanonicalStatus::Canceled => "canceled",
        }
    }

    /// Position in the forward chain, `None` for the exit states.
    pub fn forward_rank(&self) -> Option<u8> {
        match self {
            CanonicalStatus::Requested => Some(0),
            CanonicalStatus::Accepted => Some(1),
            CanonicalStatus::PickedUp => Some(2),
            CanonicalStatus::InTransit => Some(3),
            CanonicalStatus::Delivered => Some(4),
            CanonicalStatus::Failed | CanonicalStatus::Canceled => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CanonicalStatus::Delivered | CanonicalStatus::Failed | CanonicalStatus::Canceled
        )
    }
}

impl core::fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalStatus {
    type Err = DomainError;

    /// Accepts the canonical snake_case names, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        CanonicalStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| DomainError::validation(format!("unknown shipment status '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_names_case_insensitively() {
        assert_eq!("in_transit".parse::<CanonicalStatus>().unwrap(), CanonicalStatus::InTransit);
        assert_eq!(" DELIVERED ".parse::<CanonicalStatus>().unwrap(), CanonicalStatus::Delivered);
        assert!("shipped".parse::<CanonicalStatus>().is_err());
    }

    #[test]
    fn forward_chain_ranks_are_strictly_increasing() {
        let chain: Vec<u8> = CanonicalStatus::ALL
            .iter()
            .filter_map(|s| s.forward_rank())
            .collect();
        assert_eq!(chain, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = CanonicalStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![CanonicalStatus::Delivered, CanonicalStatus::Failed, CanonicalStatus::Canceled]
        );
    }

    #[test]
    fn display_matches_parse() {
        for status in CanonicalStatus::ALL {
            assert_eq!(status.to_string().parse::<CanonicalStatus>().unwrap(), status);
        }
    }
}
