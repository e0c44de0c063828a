//! `vayva-core`: shared building blocks for the reliability layer.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod version;

pub use error::DomainError;
pub use id::{CorrelationId, ShipmentId, TenantId, UserId};
pub use version::ExpectedVersion;
