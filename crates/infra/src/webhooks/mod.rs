//! Provider webhooks: authenticity checks and shipment reconciliation.

pub mod reconciler;
pub mod signature;

pub use reconciler::{
    ApplyOutcome, IgnoreReason, ReconcileError, ShipmentReconciler, StatusUpdate, WebhookOutcome,
};
pub use signature::{SignatureError, sign_courier_body, signature_header, verify};
