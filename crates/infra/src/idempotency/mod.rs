//! Idempotency guard for mutating operations.
//!
//! A client retrying a request with the same key either replays the stored
//! response, waits for the in-flight attempt, or (after a failure or an
//! abandoned lease) takes over. The same key with a different payload is
//! always a conflict.
//!
//! Typical flow:
//!
//! ```text
//! match guard.lock_key(&key, owner, &payload).await? {
//!     LockOutcome::Replay(response) => return response,
//!     LockOutcome::Acquired => {}
//! }
//! match do_work().await {
//!     Ok(resp) => guard.complete(&key, resp).await?,
//!     Err(e) => guard.fail(&key, &e.to_string()).await?,
//! }
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use vayva_core::TenantId;

use crate::config::ReliabilityConfig;
use crate::jobs::{Classify, TransportSignal};
use crate::store::{IdempotencyStore, InsertOutcome, StoreError};

pub mod fingerprint;
mod record;

pub use fingerprint::fingerprint;
pub use record::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus, StoredResponse};

/// Re-reads after losing a reclaim race before reporting in-flight.
const MAX_RESOLVE_ROUNDS: usize = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdempotencyError {
    #[error("idempotency key {key} was already used with a different request")]
    Conflict { key: String },

    #[error("request for idempotency key {key} is still in progress")]
    InFlight { key: String, retry_after: Duration },

    #[error("no idempotency record for key {0}")]
    NotFound(String),

    #[error("idempotency record {key} is {status:?}, not started")]
    NotStarted {
        key: String,
        status: IdempotencyStatus,
    },

    #[error("failed to fingerprint request payload: {0}")]
    Fingerprint(String),

    /// A configured duration pushed a timestamp past what can be stored.
    #[error("idempotency {setting} of {duration:?} is out of range")]
    OutOfRange {
        setting: &'static str,
        duration: Duration,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the caller should do after `lock_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller owns the key and must finish with `complete` or `fail`.
    Acquired,
    /// A previous attempt finished; return this response unchanged.
    Replay(StoredResponse),
}

impl LockOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, LockOutcome::Acquired)
    }
}

pub struct IdempotencyGuard<S> {
    store: S,
    lease: Duration,
    retention: Duration,
}

impl<S: IdempotencyStore> IdempotencyGuard<S> {
    pub fn new(store: S, config: &ReliabilityConfig) -> Self {
        Self {
            store,
            lease: config.idempotency_lease,
            retention: config.idempotency_retention,
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Claim `key` for this request, or learn what happened to an earlier one.
    pub async fn lock_key<P: Serialize>(
        &self,
        key: &IdempotencyKey,
        owner_id: Option<TenantId>,
        payload: &P,
    ) -> Result<LockOutcome, IdempotencyError> {
        self.lock_key_at(key, owner_id, payload, Utc::now()).await
    }

    pub async fn lock_key_at<P: Serialize>(
        &self,
        key: &IdempotencyKey,
        owner_id: Option<TenantId>,
        payload: &P,
        now: DateTime<Utc>,
    ) -> Result<LockOutcome, IdempotencyError> {
        let request_hash = fingerprint(payload)?;
        let expires_at = self.lease_deadline(now)?;
        let record =
            IdempotencyRecord::started(key.clone(), owner_id, request_hash.clone(), now, expires_at);

        let mut existing = match self.store.insert_started(record).await? {
            InsertOutcome::Inserted => {
                debug!(scope = %key.scope, key = %key.key, "idempotency key acquired");
                return Ok(LockOutcome::Acquired);
            }
            InsertOutcome::Existing(existing) => existing,
        };

        for _ in 0..MAX_RESOLVE_ROUNDS {
            if existing.request_hash != request_hash || existing.owner_id != owner_id {
                warn!(scope = %key.scope, key = %key.key, "idempotency key reused with different request");
                return Err(IdempotencyError::Conflict {
                    key: key.to_string(),
                });
            }

            match existing.status {
                IdempotencyStatus::Completed => {
                    let response = existing.stored_response.ok_or_else(|| {
                        StoreError::Serialization(format!(
                            "completed idempotency record {key} has no stored response"
                        ))
                    })?;
                    debug!(scope = %key.scope, key = %key.key, "replaying stored response");
                    return Ok(LockOutcome::Replay(response));
                }
                IdempotencyStatus::Started if !existing.is_abandoned(now) => {
                    return Err(self.in_flight(key, existing.expires_at, now));
                }
                IdempotencyStatus::Started | IdempotencyStatus::Failed => {
                    if self
                        .store
                        .reclaim(key, &request_hash, now, expires_at)
                        .await?
                        .is_some()
                    {
                        info!(
                            scope = %key.scope,
                            key = %key.key,
                            previous = existing.status.as_str(),
                            "idempotency key reclaimed"
                        );
                        return Ok(LockOutcome::Acquired);
                    }
                }
            }

            // Lost the reclaim race; see what the winner left behind.
            existing = match self.store.get(key).await? {
                Some(record) => record,
                None => return Err(IdempotencyError::NotFound(key.to_string())),
            };
        }

        Err(self.in_flight(key, existing.expires_at, now))
    }

    /// Store the response of a successful execution (`Started → Completed`).
    pub async fn complete(
        &self,
        key: &IdempotencyKey,
        response: StoredResponse,
    ) -> Result<(), IdempotencyError> {
        if self.store.mark_completed(key, &response, Utc::now()).await? {
            debug!(scope = %key.scope, key = %key.key, status_code = response.status_code, "idempotency key completed");
            return Ok(());
        }
        Err(self.not_started(key).await)
    }

    /// Release the key after a failed execution (`Started → Failed`).
    pub async fn fail(&self, key: &IdempotencyKey, reason: &str) -> Result<(), IdempotencyError> {
        if self.store.mark_failed(key, reason, Utc::now()).await? {
            info!(scope = %key.scope, key = %key.key, reason, "idempotency key failed");
            return Ok(());
        }
        Err(self.not_started(key).await)
    }

    /// Delete finished records older than the configured retention.
    pub async fn purge_expired(&self) -> Result<u64, IdempotencyError> {
        let cutoff = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .ok_or(IdempotencyError::OutOfRange {
                setting: "retention",
                duration: self.retention,
            })?;
        let purged = self.store.purge_finished_before(cutoff).await?;
        if purged > 0 {
            info!(purged, "purged finished idempotency records");
        }
        Ok(purged)
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, IdempotencyError> {
        chrono::Duration::from_std(self.lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .ok_or(IdempotencyError::OutOfRange {
                setting: "lease",
                duration: self.lease,
            })
    }

    fn in_flight(
        &self,
        key: &IdempotencyKey,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> IdempotencyError {
        let remaining = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
        IdempotencyError::InFlight {
            key: key.to_string(),
            retry_after: remaining.min(self.lease).max(Duration::from_secs(1)),
        }
    }

    async fn not_started(&self, key: &IdempotencyKey) -> IdempotencyError {
        match self.store.get(key).await {
            Ok(Some(record)) => IdempotencyError::NotStarted {
                key: key.to_string(),
                status: record.status,
            },
            Ok(None) => IdempotencyError::NotFound(key.to_string()),
            Err(e) => IdempotencyError::Store(e),
        }
    }
}

impl Classify for IdempotencyError {
    fn transport_signal(&self) -> TransportSignal {
        match self {
            IdempotencyError::Store(e) => e.transport_signal(),
            IdempotencyError::InFlight { .. } => TransportSignal::Unclassified,
            IdempotencyError::Conflict { .. }
            | IdempotencyError::NotFound(_)
            | IdempotencyError::NotStarted { .. }
            | IdempotencyError::Fingerprint(_)
            | IdempotencyError::OutOfRange { .. } => TransportSignal::Validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::store::InMemoryStore;

    fn guard() -> IdempotencyGuard<Arc<InMemoryStore>> {
        IdempotencyGuard::new(InMemoryStore::arc(), &ReliabilityConfig::default())
    }

    fn key(k: &str) -> IdempotencyKey {
        IdempotencyKey::new("shipments.create", k)
    }

    #[tokio::test]
    async fn second_lock_before_completion_is_in_flight() {
        let guard = guard();
        let payload = json!({"order_ref": "ORD-1"});

        assert!(guard.lock_key(&key("a"), None, &payload).await.unwrap().is_new());
        match guard.lock_key(&key("a"), None, &payload).await {
            Err(IdempotencyError::InFlight { retry_after, .. }) => {
                assert!(retry_after <= Duration::from_secs(60));
                assert!(retry_after >= Duration::from_secs(1));
            }
            other => panic!("expected in-flight, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_key_replays_stored_response() {
        let guard = guard();
        let payload = json!({"order_ref": "ORD-1"});
        guard.lock_key(&key("a"), None, &payload).await.unwrap();
        guard
            .complete(&key("a"), StoredResponse::new(201, br#"{"id":"x"}"#.to_vec()))
            .await
            .unwrap();

        let again = guard.lock_key(&key("a"), None, &payload).await.unwrap();
        assert_eq!(again, LockOutcome::Replay(StoredResponse::new(201, br#"{"id":"x"}"#.to_vec())));
        assert!(!again.is_new());
    }

    #[tokio::test]
    async fn different_payload_is_a_conflict() {
        let guard = guard();
        guard.lock_key(&key("a"), None, &json!({"n": 1})).await.unwrap();
        assert!(matches!(
            guard.lock_key(&key("a"), None, &json!({"n": 2})).await,
            Err(IdempotencyError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn reordered_payload_keys_match() {
        let guard = guard();
        guard
            .lock_key(&key("a"), None, &json!({"a": 1, "b": 2}))
            .await
            .unwrap();
        guard.complete(&key("a"), StoredResponse::new(200, "ok")).await.unwrap();
        assert!(matches!(
            guard.lock_key(&key("a"), None, &json!({"b": 2, "a": 1})).await,
            Ok(LockOutcome::Replay(_))
        ));
    }

    #[tokio::test]
    async fn other_owner_is_a_conflict() {
        let guard = guard();
        let payload = json!({"n": 1});
        guard.lock_key(&key("a"), Some(TenantId::new()), &payload).await.unwrap();
        assert!(matches!(
            guard.lock_key(&key("a"), Some(TenantId::new()), &payload).await,
            Err(IdempotencyError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn failed_key_can_be_retried() {
        let guard = guard();
        let payload = json!({"n": 1});
        guard.lock_key(&key("a"), None, &payload).await.unwrap();
        guard.fail(&key("a"), "gateway timeout").await.unwrap();

        assert_eq!(
            guard.lock_key(&key("a"), None, &payload).await.unwrap(),
            LockOutcome::Acquired
        );
        // And the retry holds the lock again.
        assert!(matches!(
            guard.lock_key(&key("a"), None, &payload).await,
            Err(IdempotencyError::InFlight { .. })
        ));
    }

    #[tokio::test]
    async fn abandoned_lease_is_taken_over() {
        let guard = guard();
        let payload = json!({"n": 1});
        let t0 = Utc::now();
        guard.lock_key_at(&key("a"), None, &payload, t0).await.unwrap();

        let before_expiry = t0 + chrono::Duration::seconds(30);
        assert!(guard.lock_key_at(&key("a"), None, &payload, before_expiry).await.is_err());

        let after_expiry = t0 + chrono::Duration::seconds(61);
        assert_eq!(
            guard.lock_key_at(&key("a"), None, &payload, after_expiry).await.unwrap(),
            LockOutcome::Acquired
        );
    }

    #[tokio::test]
    async fn complete_and_fail_require_started() {
        let guard = guard();
        assert!(matches!(
            guard.complete(&key("missing"), StoredResponse::new(200, "")).await,
            Err(IdempotencyError::NotFound(_))
        ));

        guard.lock_key(&key("a"), None, &json!({})).await.unwrap();
        guard.complete(&key("a"), StoredResponse::new(200, "")).await.unwrap();
        assert!(matches!(
            guard.fail(&key("a"), "late").await,
            Err(IdempotencyError::NotStarted { status: IdempotencyStatus::Completed, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_acquire_exactly_once() {
        let guard = Arc::new(guard());
        let payload = json!({"order_ref": "ORD-RACE"});

        let mut handles = Vec::new();
        for _ in 0..32 {
            let guard = guard.clone();
            let payload = payload.clone();
            handles.push(tokio::spawn(async move {
                guard.lock_key(&key("race"), None, &payload).await
            }));
        }

        let mut acquired = 0;
        let mut in_flight = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(LockOutcome::Acquired) => acquired += 1,
                Err(IdempotencyError::InFlight { .. }) => in_flight += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(acquired, 1);
        assert_eq!(in_flight, 31);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_retries_after_failure_acquire_exactly_once() {
        let guard = Arc::new(guard());
        let payload = json!({"n": 1});
        guard.lock_key(&key("retry"), None, &payload).await.unwrap();
        guard.fail(&key("retry"), "boom").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let guard = guard.clone();
            let payload = payload.clone();
            handles.push(tokio::spawn(async move {
                guard.lock_key(&key("retry"), None, &payload).await
            }));
        }

        let mut acquired = 0;
        for handle in handles {
            if let Ok(LockOutcome::Acquired) = handle.await.unwrap() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
    }

    #[tokio::test]
    async fn lease_past_the_calendar_is_an_error_not_a_panic() {
        let config = ReliabilityConfig {
            idempotency_lease: Duration::from_secs(u64::MAX),
            idempotency_retention: Duration::from_secs(u64::MAX),
            ..ReliabilityConfig::default()
        };
        let guard = IdempotencyGuard::new(InMemoryStore::arc(), &config);

        let err = guard.lock_key(&key("a"), None, &json!({})).await.unwrap_err();
        assert!(matches!(err, IdempotencyError::OutOfRange { setting: "lease", .. }));
        assert_eq!(err.error_class(), crate::jobs::ErrorClass::Permanent);
        assert!(matches!(
            guard.purge_expired().await,
            Err(IdempotencyError::OutOfRange { setting: "retention", .. })
        ));
    }

    #[tokio::test]
    async fn purge_removes_only_old_finished_records() {
        let store = InMemoryStore::arc();
        let config = ReliabilityConfig {
            idempotency_retention: Duration::from_secs(1),
            ..ReliabilityConfig::default()
        };
        let guard = IdempotencyGuard::new(store.clone(), &config);
        let old = Utc::now() - chrono::Duration::hours(1);

        guard.lock_key_at(&key("old"), None, &json!({}), old).await.unwrap();
        store
            .mark_completed(&key("old"), &StoredResponse::new(200, ""), old)
            .await
            .unwrap();
        guard.lock_key(&key("live"), None, &json!({})).await.unwrap();

        assert_eq!(guard.purge_expired().await.unwrap(), 1);
        assert!(IdempotencyStore::get(&store, &key("old")).await.unwrap().is_none());
        assert!(IdempotencyStore::get(&store, &key("live")).await.unwrap().is_some());
    }
}
