//! Postgres-backed store.
//!
//! ## Atomicity
//!
//! | Operation | Mechanism |
//! |-----------|-----------|
//! | `insert_started` | `INSERT … ON CONFLICT (scope, key) DO NOTHING` |
//! | `reclaim`, `mark_*` | conditional `UPDATE … WHERE status = …` |
//! | `record_dead_letter` | unique index on `correlation_id` over `dead` rows + `ON CONFLICT DO NOTHING` |
//! | `commit_transition` | `UPDATE shipments … WHERE version = $n` and the history insert in one transaction |
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (other) | any | `Storage` |
//! | anything else | N/A | `Storage` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use vayva_core::{CorrelationId, ExpectedVersion, ShipmentId, TenantId};
use vayva_shipments::{
    CanonicalStatus, CourierInfo, DeliveryEvent, EventSource, Provider, Shipment,
};

use super::{IdempotencyStore, InsertOutcome, JobStore, ShipmentStore, StoreError};
use crate::idempotency::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus, StoredResponse};
use crate::jobs::{
    DeadLetterEntry, DeadLetterId, DeadLetterStatus, ErrorClass, JobRun, JobRunId, JobRunStatus,
};

const MIGRATION: &str = include_str!("../../migrations/0001_reliability.sql");

const IDEMPOTENCY_COLUMNS: &str = "scope, key, owner_id, request_hash, status, response_status, \
     response_body, failure_reason, expires_at, created_at, updated_at";

const JOB_RUN_COLUMNS: &str = "id, job_name, owner_id, correlation_id, attempt_number, status, \
     error_class, last_error, started_at, completed_at, duration_ms";

const DEAD_LETTER_COLUMNS: &str = "id, owner_id, job_type, correlation_id, attempts, \
     payload_snapshot, last_error, status, created_at, resolved_at";

const SHIPMENT_COLUMNS: &str = "id, owner_id, order_ref, provider, external_tracking_code, \
     canonical_status, provider_raw_status, courier_name, courier_phone, courier_tracking_url, \
     version, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema. Every statement is idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in MIGRATION.split(';').map(str::trim) {
            if statement.lines().all(|l| l.trim().is_empty() || l.trim_start().starts_with("--")) {
                continue;
            }
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    async fn load_history(
        &self,
        shipment_id: Uuid,
    ) -> Result<Vec<DeliveryEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, raw_status, occurred_at, note, source
            FROM delivery_events
            WHERE shipment_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(shipment_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_history", e))?;

        rows.iter().map(delivery_event_from_row).collect()
    }

    async fn shipment_with_history(&self, row: &PgRow) -> Result<Shipment, StoreError> {
        let mut shipment = shipment_from_row(row)?;
        shipment.history = self.load_history(*shipment.id.as_uuid()).await?;
        Ok(shipment)
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for PostgresStore {
    #[instrument(skip(self, record), fields(scope = %record.key.scope, key = %record.key.key), err)]
    async fn insert_started(&self, record: IdempotencyRecord) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_records (
                scope, key, owner_id, request_hash, status,
                expires_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 'started', $5, $6, $7)
            ON CONFLICT (scope, key) DO NOTHING
            "#,
        )
        .bind(&record.key.scope)
        .bind(&record.key.key)
        .bind(record.owner_id.map(|t| *t.as_uuid()))
        .bind(&record.request_hash)
        .bind(record.expires_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_started", e))?;

        if result.rows_affected() == 1 {
            return Ok(InsertOutcome::Inserted);
        }

        match IdempotencyStore::get(self, &record.key).await? {
            Some(existing) => Ok(InsertOutcome::Existing(existing)),
            // Purged between the conflict and the read.
            None => Err(StoreError::Concurrency(format!(
                "idempotency record {} vanished during insert",
                record.key
            ))),
        }
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {IDEMPOTENCY_COLUMNS} FROM idempotency_records WHERE scope = $1 AND key = $2"
        ))
        .bind(&key.scope)
        .bind(&key.key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_idempotency_record", e))?;

        row.as_ref().map(idempotency_record_from_row).transpose()
    }

    #[instrument(skip(self, request_hash), fields(scope = %key.scope, key = %key.key), err)]
    async fn reclaim(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE idempotency_records
            SET status = 'started',
                response_status = NULL,
                response_body = NULL,
                failure_reason = NULL,
                expires_at = $4,
                updated_at = $3
            WHERE scope = $1
              AND key = $2
              AND request_hash = $5
              AND (status = 'failed' OR (status = 'started' AND expires_at <= $3))
            RETURNING {IDEMPOTENCY_COLUMNS}
            "#
        ))
        .bind(&key.scope)
        .bind(&key.key)
        .bind(now)
        .bind(expires_at)
        .bind(request_hash)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim", e))?;

        row.as_ref().map(idempotency_record_from_row).transpose()
    }

    #[instrument(skip(self, response), fields(scope = %key.scope, key = %key.key), err)]
    async fn mark_completed(
        &self,
        key: &IdempotencyKey,
        response: &StoredResponse,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = 'completed', response_status = $3, response_body = $4, updated_at = $5
            WHERE scope = $1 AND key = $2 AND status = 'started'
            "#,
        )
        .bind(&key.scope)
        .bind(&key.key)
        .bind(i32::from(response.status_code))
        .bind(&response.body)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_completed", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(scope = %key.scope, key = %key.key), err)]
    async fn mark_failed(
        &self,
        key: &IdempotencyKey,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = 'failed', failure_reason = $3, updated_at = $4
            WHERE scope = $1 AND key = $2 AND status = 'started'
            "#,
        )
        .bind(&key.scope)
        .bind(&key.key)
        .bind(reason)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM idempotency_records WHERE status IN ('completed', 'failed') AND updated_at < $1",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_finished_before", e))?;

        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresStore {
    #[instrument(skip(self, run), fields(job_name = %run.job_name, correlation_id = %run.correlation_id, attempt = run.attempt_number), err)]
    async fn open_run(&self, run: &JobRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_runs (id, job_name, owner_id, correlation_id, attempt_number, status, started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run.id.0)
        .bind(&run.job_name)
        .bind(run.owner_id.map(|t| *t.as_uuid()))
        .bind(run.correlation_id.as_uuid())
        .bind(run.attempt_number as i32)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("open_run", e))?;

        Ok(())
    }

    #[instrument(skip(self, run), fields(run_id = %run.id, status = run.status.as_str()), err)]
    async fn finish_run(&self, run: &JobRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $2, error_class = $3, last_error = $4, completed_at = $5, duration_ms = $6
            WHERE id = $1
            "#,
        )
        .bind(run.id.0)
        .bind(run.status.as_str())
        .bind(run.error_class.map(|c| c.as_str()))
        .bind(run.last_error.as_deref())
        .bind(run.completed_at)
        .bind(run.duration_ms.map(|d| d as i64))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finish_run", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job run {}", run.id)));
        }
        Ok(())
    }

    async fn runs_for_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Vec<JobRun>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_RUN_COLUMNS} FROM job_runs WHERE correlation_id = $1 \
             ORDER BY attempt_number ASC, started_at ASC"
        ))
        .bind(correlation_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("runs_for_correlation", e))?;

        rows.iter().map(job_run_from_row).collect()
    }

    #[instrument(skip(self, entry), fields(correlation_id = %entry.correlation_id, job_type = %entry.job_type), err)]
    async fn record_dead_letter(&self, entry: &DeadLetterEntry) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO dead_letters (
                id, owner_id, job_type, correlation_id, attempts,
                payload_snapshot, last_error, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (correlation_id) WHERE status = 'dead' DO NOTHING
            "#,
        )
        .bind(entry.id.0)
        .bind(entry.owner_id.map(|t| *t.as_uuid()))
        .bind(&entry.job_type)
        .bind(entry.correlation_id.as_uuid())
        .bind(entry.attempts as i32)
        .bind(&entry.payload_snapshot)
        .bind(&entry.last_error)
        .bind(entry.status.as_str())
        .bind(entry.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_dead_letter", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_dead_letter", e))?;

        row.as_ref().map(dead_letter_from_row).transpose()
    }

    async fn list_dead_letters(
        &self,
        owner_id: Option<TenantId>,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DEAD_LETTER_COLUMNS}
            FROM dead_letters
            WHERE owner_id IS NOT DISTINCT FROM $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#
        ))
        .bind(owner_id.map(|t| *t.as_uuid()))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    #[instrument(skip(self), fields(dead_letter_id = %id, from = from.as_str(), to = to.as_str()), err)]
    async fn transition_dead_letter(
        &self,
        id: DeadLetterId,
        from: DeadLetterStatus,
        to: DeadLetterStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE dead_letters SET status = $3, resolved_at = $4 WHERE id = $1 AND status = $2",
        )
        .bind(id.0)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_dead_letter", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_dead_letter(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("dead letter {id}"))),
        }
    }
}

#[async_trait::async_trait]
impl ShipmentStore for PostgresStore {
    #[instrument(skip(self, shipment), fields(shipment_id = %shipment.id), err)]
    async fn insert(&self, shipment: &Shipment) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(&format!(
            "INSERT INTO shipments ({SHIPMENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(shipment.id.as_uuid())
        .bind(shipment.owner_id.map(|t| *t.as_uuid()))
        .bind(&shipment.order_ref)
        .bind(shipment.provider.as_str())
        .bind(shipment.external_tracking_code.as_deref())
        .bind(shipment.canonical_status.as_str())
        .bind(shipment.provider_raw_status.as_deref())
        .bind(shipment.courier.name.as_deref())
        .bind(shipment.courier.phone.as_deref())
        .bind(shipment.courier.tracking_url.as_deref())
        .bind(shipment.version as i64)
        .bind(shipment.created_at)
        .bind(shipment.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_shipment", e))?;

        for (idx, event) in shipment.history.iter().enumerate() {
            insert_event(&mut tx, shipment.id, idx + 1, event).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    async fn get(&self, id: ShipmentId) -> Result<Option<Shipment>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SHIPMENT_COLUMNS} FROM shipments WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_shipment", e))?;

        match row {
            Some(row) => Ok(Some(self.shipment_with_history(&row).await?)),
            None => Ok(None),
        }
    }

    async fn find_by_tracking_code(
        &self,
        provider: Provider,
        tracking_code: &str,
    ) -> Result<Option<Shipment>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SHIPMENT_COLUMNS} FROM shipments WHERE provider = $1 AND external_tracking_code = $2"
        ))
        .bind(provider.as_str())
        .bind(tracking_code)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_tracking_code", e))?;

        match row {
            Some(row) => Ok(Some(self.shipment_with_history(&row).await?)),
            None => Ok(None),
        }
    }

    #[instrument(
        skip(self, updated),
        fields(shipment_id = %updated.id, status = updated.canonical_status.as_str(), expected_version = ?expected),
        err
    )]
    async fn commit_transition(
        &self,
        updated: &Shipment,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let expected_version = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let result = sqlx::query(
            r#"
            UPDATE shipments
            SET canonical_status = $3,
                provider_raw_status = $4,
                external_tracking_code = $5,
                courier_name = $6,
                courier_phone = $7,
                courier_tracking_url = $8,
                version = $9,
                updated_at = $10
            WHERE id = $1 AND ($2::bigint IS NULL OR version = $2)
            "#,
        )
        .bind(updated.id.as_uuid())
        .bind(expected_version)
        .bind(updated.canonical_status.as_str())
        .bind(updated.provider_raw_status.as_deref())
        .bind(updated.external_tracking_code.as_deref())
        .bind(updated.courier.name.as_deref())
        .bind(updated.courier.phone.as_deref())
        .bind(updated.courier.tracking_url.as_deref())
        .bind(updated.version as i64)
        .bind(updated.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_shipment", e))?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return match ShipmentStore::get(self, updated.id).await? {
                Some(current) => Err(StoreError::Concurrency(format!(
                    "shipment {} is at version {}, expected {:?}",
                    updated.id, current.version, expected
                ))),
                None => Err(StoreError::NotFound(format!("shipment {}", updated.id))),
            };
        }

        if let Some(event) = updated.history.last() {
            insert_event(&mut tx, updated.id, updated.history.len(), event).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    shipment_id: ShipmentId,
    seq: usize,
    event: &DeliveryEvent,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO delivery_events (shipment_id, seq, status, raw_status, occurred_at, note, source)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(shipment_id.as_uuid())
    .bind(seq as i32)
    .bind(event.status.as_str())
    .bind(event.raw_status.as_deref())
    .bind(event.occurred_at)
    .bind(event.note.as_deref())
    .bind(event.source.as_str())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_delivery_event", e))?;
    Ok(())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Serialization(format!("failed to decode row: {err}"))
}

fn bad_value(column: &str, value: &str) -> StoreError {
    StoreError::Serialization(format!("unexpected {column} value '{value}'"))
}

fn idempotency_record_from_row(row: &PgRow) -> Result<IdempotencyRecord, StoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let response_status: Option<i32> = row.try_get("response_status").map_err(decode_error)?;
    let response_body: Option<Vec<u8>> = row.try_get("response_body").map_err(decode_error)?;
    let owner_id: Option<Uuid> = row.try_get("owner_id").map_err(decode_error)?;

    let stored_response = match (response_status, response_body) {
        (Some(code), Some(body)) => Some(StoredResponse {
            status_code: u16::try_from(code).map_err(|_| bad_value("response_status", &code.to_string()))?,
            body,
        }),
        _ => None,
    };

    Ok(IdempotencyRecord {
        key: IdempotencyKey {
            scope: row.try_get("scope").map_err(decode_error)?,
            key: row.try_get("key").map_err(decode_error)?,
        },
        owner_id: owner_id.map(TenantId::from_uuid),
        request_hash: row.try_get("request_hash").map_err(decode_error)?,
        status: IdempotencyStatus::parse(&status).ok_or_else(|| bad_value("status", &status))?,
        stored_response,
        failure_reason: row.try_get("failure_reason").map_err(decode_error)?,
        expires_at: row.try_get("expires_at").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
    })
}

fn job_run_from_row(row: &PgRow) -> Result<JobRun, StoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let error_class: Option<String> = row.try_get("error_class").map_err(decode_error)?;
    let owner_id: Option<Uuid> = row.try_get("owner_id").map_err(decode_error)?;
    let attempt_number: i32 = row.try_get("attempt_number").map_err(decode_error)?;
    let duration_ms: Option<i64> = row.try_get("duration_ms").map_err(decode_error)?;

    Ok(JobRun {
        id: JobRunId(row.try_get("id").map_err(decode_error)?),
        job_name: row.try_get("job_name").map_err(decode_error)?,
        owner_id: owner_id.map(TenantId::from_uuid),
        correlation_id: CorrelationId::from_uuid(row.try_get("correlation_id").map_err(decode_error)?),
        attempt_number: attempt_number.max(0) as u32,
        status: JobRunStatus::parse(&status).ok_or_else(|| bad_value("status", &status))?,
        error_class: match error_class {
            Some(raw) => Some(ErrorClass::parse(&raw).ok_or_else(|| bad_value("error_class", &raw))?),
            None => None,
        },
        last_error: row.try_get("last_error").map_err(decode_error)?,
        started_at: row.try_get("started_at").map_err(decode_error)?,
        completed_at: row.try_get("completed_at").map_err(decode_error)?,
        duration_ms: duration_ms.map(|d| d.max(0) as u64),
    })
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetterEntry, StoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let owner_id: Option<Uuid> = row.try_get("owner_id").map_err(decode_error)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode_error)?;

    Ok(DeadLetterEntry {
        id: DeadLetterId(row.try_get("id").map_err(decode_error)?),
        owner_id: owner_id.map(TenantId::from_uuid),
        job_type: row.try_get("job_type").map_err(decode_error)?,
        correlation_id: CorrelationId::from_uuid(row.try_get("correlation_id").map_err(decode_error)?),
        attempts: attempts.max(0) as u32,
        payload_snapshot: row.try_get("payload_snapshot").map_err(decode_error)?,
        last_error: row.try_get("last_error").map_err(decode_error)?,
        status: DeadLetterStatus::parse(&status).ok_or_else(|| bad_value("status", &status))?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        resolved_at: row.try_get("resolved_at").map_err(decode_error)?,
    })
}

fn shipment_from_row(row: &PgRow) -> Result<Shipment, StoreError> {
    let provider: String = row.try_get("provider").map_err(decode_error)?;
    let status: String = row.try_get("canonical_status").map_err(decode_error)?;
    let owner_id: Option<Uuid> = row.try_get("owner_id").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;

    Ok(Shipment {
        id: ShipmentId::from_uuid(row.try_get("id").map_err(decode_error)?),
        owner_id: owner_id.map(TenantId::from_uuid),
        order_ref: row.try_get("order_ref").map_err(decode_error)?,
        provider: provider
            .parse::<Provider>()
            .map_err(|_| bad_value("provider", &provider))?,
        external_tracking_code: row.try_get("external_tracking_code").map_err(decode_error)?,
        canonical_status: status
            .parse::<CanonicalStatus>()
            .map_err(|_| bad_value("canonical_status", &status))?,
        provider_raw_status: row.try_get("provider_raw_status").map_err(decode_error)?,
        courier: CourierInfo {
            name: row.try_get("courier_name").map_err(decode_error)?,
            phone: row.try_get("courier_phone").map_err(decode_error)?,
            tracking_url: row.try_get("courier_tracking_url").map_err(decode_error)?,
        },
        version: version.max(0) as u64,
        history: Vec::new(),
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
    })
}

fn delivery_event_from_row(row: &PgRow) -> Result<DeliveryEvent, StoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let source: String = row.try_get("source").map_err(decode_error)?;

    Ok(DeliveryEvent {
        status: status
            .parse::<CanonicalStatus>()
            .map_err(|_| bad_value("status", &status))?,
        raw_status: row.try_get("raw_status").map_err(decode_error)?,
        occurred_at: row.try_get("occurred_at").map_err(decode_error)?,
        note: row.try_get("note").map_err(decode_error)?,
        source: source
            .parse::<EventSource>()
            .map_err(|_| bad_value("source", &source))?,
    })
}
