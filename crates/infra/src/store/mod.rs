//! Durable state shared by the reliability components.
//!
//! Each component talks to its own trait. Correctness rests on two store
//! primitives that every implementation must provide atomically:
//!
//! - **unique insert**: `IdempotencyStore::insert_started`,
//!   `JobStore::record_dead_letter`, `ShipmentStore::insert`;
//! - **compare-and-swap**: `IdempotencyStore::reclaim`/`mark_*`,
//!   `JobStore::transition_dead_letter`, `ShipmentStore::commit_transition`.
//!
//! `InMemoryStore` backs tests and local development; `PostgresStore` is the
//! production implementation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use vayva_core::{CorrelationId, ExpectedVersion, ShipmentId, TenantId};
use vayva_shipments::{Provider, Shipment};

use crate::idempotency::{IdempotencyKey, IdempotencyRecord, StoredResponse};
use crate::jobs::{DeadLetterEntry, DeadLetterId, DeadLetterStatus, JobRun};

mod in_memory;
mod postgres;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A compare-and-swap lost against another writer.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// A unique constraint fired (taken id or tracking code).
    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result of an atomic unique insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Someone got there first; this is their record.
    Existing(IdempotencyRecord),
}

#[async_trait::async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Insert a `Started` record unless one already exists for its key.
    async fn insert_started(&self, record: IdempotencyRecord) -> Result<InsertOutcome, StoreError>;

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Flip a `Failed` or lease-expired `Started` record with a matching hash
    /// back to `Started` under a new lease.
    ///
    /// Returns `None` when the record no longer satisfies that condition.
    async fn reclaim(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// `Started → Completed`. Returns `false` when the record is not `Started`
    /// (or does not exist).
    async fn mark_completed(
        &self,
        key: &IdempotencyKey,
        response: &StoredResponse,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// `Started → Failed`. Same contract as `mark_completed`.
    async fn mark_failed(
        &self,
        key: &IdempotencyKey,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Delete finished records last touched before `cutoff`.
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    async fn open_run(&self, run: &JobRun) -> Result<(), StoreError>;

    /// Persist the terminal state of a run opened with `open_run`.
    async fn finish_run(&self, run: &JobRun) -> Result<(), StoreError>;

    async fn runs_for_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Vec<JobRun>, StoreError>;

    /// Insert unless a `Dead` entry already exists for the correlation id.
    /// Replayed and discarded entries do not block a new one.
    ///
    /// Returns `true` when this call created the entry.
    async fn record_dead_letter(&self, entry: &DeadLetterEntry) -> Result<bool, StoreError>;

    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Newest first. `None` lists entries of system jobs, which have no owner.
    async fn list_dead_letters(
        &self,
        owner_id: Option<TenantId>,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Conditional status flip. Returns `false` if the entry is not in `from`.
    async fn transition_dead_letter(
        &self,
        id: DeadLetterId,
        from: DeadLetterStatus,
        to: DeadLetterStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

#[async_trait::async_trait]
pub trait ShipmentStore: Send + Sync {
    /// Fails with `Duplicate` when the id or `(provider, tracking code)` is taken.
    async fn insert(&self, shipment: &Shipment) -> Result<(), StoreError>;

    async fn get(&self, id: ShipmentId) -> Result<Option<Shipment>, StoreError>;

    async fn find_by_tracking_code(
        &self,
        provider: Provider,
        tracking_code: &str,
    ) -> Result<Option<Shipment>, StoreError>;

    /// Commit `updated` if the stored version still matches `expected`.
    ///
    /// `updated` must be the stored state plus exactly one applied transition;
    /// only its last history entry is appended. A version mismatch is
    /// `Concurrency`; a tracking code owned by another shipment is `Duplicate`.
    async fn commit_transition(
        &self,
        updated: &Shipment,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl<S: IdempotencyStore + ?Sized> IdempotencyStore for Arc<S> {
    async fn insert_started(&self, record: IdempotencyRecord) -> Result<InsertOutcome, StoreError> {
        (**self).insert_started(record).await
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
        (**self).get(key).await
    }

    async fn reclaim(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        (**self).reclaim(key, request_hash, now, expires_at).await
    }

    async fn mark_completed(
        &self,
        key: &IdempotencyKey,
        response: &StoredResponse,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).mark_completed(key, response, now).await
    }

    async fn mark_failed(
        &self,
        key: &IdempotencyKey,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).mark_failed(key, reason, now).await
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).purge_finished_before(cutoff).await
    }
}

#[async_trait::async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn open_run(&self, run: &JobRun) -> Result<(), StoreError> {
        (**self).open_run(run).await
    }

    async fn finish_run(&self, run: &JobRun) -> Result<(), StoreError> {
        (**self).finish_run(run).await
    }

    async fn runs_for_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Vec<JobRun>, StoreError> {
        (**self).runs_for_correlation(correlation_id).await
    }

    async fn record_dead_letter(&self, entry: &DeadLetterEntry) -> Result<bool, StoreError> {
        (**self).record_dead_letter(entry).await
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        (**self).get_dead_letter(id).await
    }

    async fn list_dead_letters(
        &self,
        owner_id: Option<TenantId>,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        (**self).list_dead_letters(owner_id, status, limit).await
    }

    async fn transition_dead_letter(
        &self,
        id: DeadLetterId,
        from: DeadLetterStatus,
        to: DeadLetterStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).transition_dead_letter(id, from, to, now).await
    }
}

#[async_trait::async_trait]
impl<S: ShipmentStore + ?Sized> ShipmentStore for Arc<S> {
    async fn insert(&self, shipment: &Shipment) -> Result<(), StoreError> {
        (**self).insert(shipment).await
    }

    async fn get(&self, id: ShipmentId) -> Result<Option<Shipment>, StoreError> {
        (**self).get(id).await
    }

    async fn find_by_tracking_code(
        &self,
        provider: Provider,
        tracking_code: &str,
    ) -> Result<Option<Shipment>, StoreError> {
        (**self).find_by_tracking_code(provider, tracking_code).await
    }

    async fn commit_transition(
        &self,
        updated: &Shipment,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        (**self).commit_transition(updated, expected).await
    }
}
