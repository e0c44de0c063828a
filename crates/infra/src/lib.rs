//! Reliability infrastructure: stores, idempotency, job execution and
//! webhook reconciliation.

pub mod config;
pub mod idempotency;
pub mod jobs;
pub mod store;
pub mod webhooks;
