//! Lifecycle adjacency maps.
//!
//! Two maps exist because the two callers have different trust levels:
//! - provider webhooks may skip forward (couriers often omit intermediate
//!   updates) but never move backward;
//! - operators follow an explicit step-by-step allow-list.
//!
//! Terminal states (`Delivered`, `Failed`, `Canceled`) have no outgoing edges in
//! either map.

use crate::status::CanonicalStatus::{self, *};

/// Allowed webhook-driven next states for `from`.
pub fn webhook_targets(from: CanonicalStatus) -> &'static [CanonicalStatus] {
    match from {
        Requested => &[Accepted, PickedUp, InTransit, Delivered, Failed, Canceled],
        Accepted => &[PickedUp, InTransit, Delivered, Failed, Canceled],
        PickedUp => &[InTransit, Delivered, Failed, Canceled],
        InTransit => &[Delivered, Failed, Canceled],
        Delivered | Failed | Canceled => &[],
    }
}

/// Allowed operator-driven next states for `from`.
///
/// `Canceled` is present for every non-terminal state (operator escape hatch).
pub fn manual_targets(from: CanonicalStatus) -> &'static [CanonicalStatus] {
    match from {
        Requested => &[Accepted, Canceled],
        Accepted => &[PickedUp, Failed, Canceled],
        PickedUp => &[InTransit, Delivered, Failed, Canceled],
        InTransit => &[Delivered, Failed, Canceled],
        Delivered | Failed | Canceled => &[],
    }
}

pub fn can_webhook_transition(from: CanonicalStatus, to: CanonicalStatus) -> bool {
    webhook_targets(from).contains(&to)
}

pub fn can_manual_transition(from: CanonicalStatus, to: CanonicalStatus) -> bool {
    manual_targets(from).contains(&to)
}

/// How a webhook-reported status relates to the current one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WebhookMove {
    /// Forward move (or exit); must be applied.
    Advance,
    /// Same status re-delivered.
    Duplicate,
    /// Earlier in the forward order than the current status.
    OutOfOrder,
    /// Current status is terminal; nothing may change.
    Terminal,
}

pub fn classify_webhook(from: CanonicalStatus, to: CanonicalStatus) -> WebhookMove {
    if from == to {
        WebhookMove::Duplicate
    } else if from.is_terminal() {
        WebhookMove::Terminal
    } else if can_webhook_transition(from, to) {
        WebhookMove::Advance
    } else {
        WebhookMove::OutOfOrder
    }
}
