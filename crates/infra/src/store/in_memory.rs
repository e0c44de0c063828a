//! In-memory store for tests and local development.
//!
//! Every operation takes the relevant write lock for its whole
//! read-check-write sequence, which gives the same atomicity the Postgres
//! implementation gets from unique constraints and conditional updates.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use vayva_core::{CorrelationId, ExpectedVersion, ShipmentId, TenantId};
use vayva_shipments::{Provider, Shipment};

use super::{IdempotencyStore, InsertOutcome, JobStore, ShipmentStore, StoreError};
use crate::idempotency::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus, StoredResponse};
use crate::jobs::{DeadLetterEntry, DeadLetterId, DeadLetterStatus, JobRun, JobRunId};

#[derive(Debug, Default)]
pub struct InMemoryStore {
    idempotency: RwLock<HashMap<IdempotencyKey, IdempotencyRecord>>,
    runs: RwLock<HashMap<JobRunId, JobRun>>,
    dead_letters: RwLock<HashMap<DeadLetterId, DeadLetterEntry>>,
    shipments: RwLock<HashMap<ShipmentId, Shipment>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of dead letters across all owners (test helper).
    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.read().map(|m| m.len()).unwrap_or(0)
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read()
        .map_err(|_| StoreError::Storage("in-memory store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write()
        .map_err(|_| StoreError::Storage("in-memory store lock poisoned".to_string()))
}

#[async_trait::async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn insert_started(&self, record: IdempotencyRecord) -> Result<InsertOutcome, StoreError> {
        let mut records = write(&self.idempotency)?;
        if let Some(existing) = records.get(&record.key) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        records.insert(record.key.clone(), record);
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(read(&self.idempotency)?.get(key).cloned())
    }

    async fn reclaim(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let mut records = write(&self.idempotency)?;
        let Some(record) = records.get_mut(key) else {
            return Ok(None);
        };
        if record.request_hash != request_hash || !record.is_reclaimable(now) {
            return Ok(None);
        }

        record.status = IdempotencyStatus::Started;
        record.failure_reason = None;
        record.stored_response = None;
        record.expires_at = expires_at;
        record.updated_at = now;
        Ok(Some(record.clone()))
    }

    async fn mark_completed(
        &self,
        key: &IdempotencyKey,
        response: &StoredResponse,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut records = write(&self.idempotency)?;
        match records.get_mut(key) {
            Some(record) if record.status == IdempotencyStatus::Started => {
                record.status = IdempotencyStatus::Completed;
                record.stored_response = Some(response.clone());
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(
        &self,
        key: &IdempotencyKey,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut records = write(&self.idempotency)?;
        match records.get_mut(key) {
            Some(record) if record.status == IdempotencyStatus::Started => {
                record.status = IdempotencyStatus::Failed;
                record.failure_reason = Some(reason.to_string());
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = write(&self.idempotency)?;
        let before = records.len();
        records.retain(|_, r| r.status == IdempotencyStatus::Started || r.updated_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryStore {
    async fn open_run(&self, run: &JobRun) -> Result<(), StoreError> {
        let mut runs = write(&self.runs)?;
        if runs.contains_key(&run.id) {
            return Err(StoreError::Duplicate(format!("job run {} already exists", run.id)));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn finish_run(&self, run: &JobRun) -> Result<(), StoreError> {
        let mut runs = write(&self.runs)?;
        match runs.get_mut(&run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("job run {}", run.id))),
        }
    }

    async fn runs_for_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Vec<JobRun>, StoreError> {
        let runs = read(&self.runs)?;
        let mut result: Vec<_> = runs
            .values()
            .filter(|r| r.correlation_id == correlation_id)
            .cloned()
            .collect();
        result.sort_by_key(|r| (r.attempt_number, r.started_at));
        Ok(result)
    }

    async fn record_dead_letter(&self, entry: &DeadLetterEntry) -> Result<bool, StoreError> {
        let mut dls = write(&self.dead_letters)?;
        let open = dls
            .values()
            .any(|e| e.correlation_id == entry.correlation_id && e.status == DeadLetterStatus::Dead);
        if open {
            return Ok(false);
        }
        dls.insert(entry.id, entry.clone());
        Ok(true)
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        Ok(read(&self.dead_letters)?.get(&id).cloned())
    }

    async fn list_dead_letters(
        &self,
        owner_id: Option<TenantId>,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let dls = read(&self.dead_letters)?;
        let mut result: Vec<_> = dls
            .values()
            .filter(|e| e.owner_id == owner_id && status.is_none_or(|s| e.status == s))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn transition_dead_letter(
        &self,
        id: DeadLetterId,
        from: DeadLetterStatus,
        to: DeadLetterStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut dls = write(&self.dead_letters)?;
        match dls.get_mut(&id) {
            Some(entry) if entry.status == from => {
                entry.status = to;
                entry.resolved_at = Some(now);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("dead letter {id}"))),
        }
    }
}

#[async_trait::async_trait]
impl ShipmentStore for InMemoryStore {
    async fn insert(&self, shipment: &Shipment) -> Result<(), StoreError> {
        let mut shipments = write(&self.shipments)?;
        if shipments.contains_key(&shipment.id) {
            return Err(StoreError::Duplicate(format!("shipment {} already exists", shipment.id)));
        }
        ensure_tracking_code_free(&shipments, shipment)?;
        shipments.insert(shipment.id, shipment.clone());
        Ok(())
    }

    async fn get(&self, id: ShipmentId) -> Result<Option<Shipment>, StoreError> {
        Ok(read(&self.shipments)?.get(&id).cloned())
    }

    async fn find_by_tracking_code(
        &self,
        provider: Provider,
        tracking_code: &str,
    ) -> Result<Option<Shipment>, StoreError> {
        let shipments = read(&self.shipments)?;
        Ok(shipments
            .values()
            .find(|s| s.provider == provider && s.external_tracking_code.as_deref() == Some(tracking_code))
            .cloned())
    }

    async fn commit_transition(
        &self,
        updated: &Shipment,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let mut shipments = write(&self.shipments)?;
        let current_version = shipments
            .get(&updated.id)
            .map(|s| s.version)
            .ok_or_else(|| StoreError::NotFound(format!("shipment {}", updated.id)))?;

        if !expected.matches(current_version) {
            return Err(StoreError::Concurrency(format!(
                "shipment {} is at version {}, expected {:?}",
                updated.id, current_version, expected
            )));
        }
        ensure_tracking_code_free(&shipments, updated)?;

        shipments.insert(updated.id, updated.clone());
        Ok(())
    }
}

/// Mirrors the partial unique index on `(provider, external_tracking_code)`.
fn ensure_tracking_code_free(
    shipments: &HashMap<ShipmentId, Shipment>,
    shipment: &Shipment,
) -> Result<(), StoreError> {
    let Some(code) = shipment.external_tracking_code.as_deref() else {
        return Ok(());
    };
    let taken = shipments.values().any(|s| {
        s.id != shipment.id
            && s.provider == shipment.provider
            && s.external_tracking_code.as_deref() == Some(code)
    });
    if taken {
        return Err(StoreError::Duplicate(format!(
            "tracking code {code} already registered for {}",
            shipment.provider
        )));
    }
    Ok(())
}
