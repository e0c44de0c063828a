//! Errors raised while parsing or mutating shipment values.

use thiserror::Error;

/// A value or a state change was rejected before anything was stored.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input: empty order refs, unknown providers or statuses.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A string did not parse as the named id type.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The shipment lifecycle does not allow `from -> to`.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(from: impl core::fmt::Display, to: impl core::fmt::Display) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
