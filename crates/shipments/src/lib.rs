//! Shipment lifecycle domain module.
//!
//! This crate contains the delivery state machine, implemented purely as
//! deterministic domain logic (no IO, no HTTP, no storage):
//! - `status`: the canonical lifecycle and its forward order
//! - `transitions`: adjacency maps for webhook-driven and operator-driven moves
//! - `vocabulary`: per-provider raw status tables
//! - `shipment`: the aggregate and its append-only delivery history

pub mod shipment;
pub mod status;
pub mod transitions;
pub mod vocabulary;

pub use shipment::{CourierInfo, DeliveryEvent, EventSource, Shipment, Transition};
pub use status::CanonicalStatus;
pub use transitions::{WebhookMove, classify_webhook, manual_targets, webhook_targets};
pub use vocabulary::{Provider, translate};
