//! Single-attempt job execution with bookkeeping.
//!
//! The runner executes one attempt, records it as a [`JobRun`], classifies a
//! failure and either hands back a retry delay or dead-letters the chain.
//! Scheduling the next attempt is the caller's business; nothing here sleeps.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use vayva_core::{CorrelationId, TenantId};

use crate::config::ReliabilityConfig;
use crate::store::{JobStore, StoreError};

use super::backoff::BackoffSchedule;
use super::classify::Classify;
use super::types::{DeadLetterEntry, DeadLetterId, DeadLetterStatus, ErrorClass, JobRun};

/// What to do with a permanent failure before the attempt budget runs out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermanentFailurePolicy {
    /// Permanent failures are retried like transient ones until the budget is spent.
    #[default]
    CountTowardsBudget,
    DeadLetterImmediately,
}

/// One attempt of a job chain.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub job_name: String,
    pub owner_id: Option<TenantId>,
    /// `None` starts a new chain.
    pub correlation_id: Option<CorrelationId>,
    /// 1-indexed.
    pub attempt: u32,
    /// `None` uses the configured budget.
    pub max_attempts: Option<u32>,
    /// Stored verbatim if the chain is dead-lettered.
    pub payload: Value,
}

impl JobSpec {
    pub fn new(job_name: impl Into<String>, payload: Value) -> Self {
        Self {
            job_name: job_name.into(),
            owner_id: None,
            correlation_id: None,
            attempt: 1,
            max_attempts: None,
            payload,
        }
    }

    pub fn with_owner(mut self, owner_id: TenantId) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Handed to the work closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_name: String,
    pub owner_id: Option<TenantId>,
    pub correlation_id: CorrelationId,
    pub attempt: u32,
}

/// A failed attempt. The original error is preserved.
#[derive(Debug)]
pub struct JobFailure<E> {
    error: E,
    pub class: ErrorClass,
    pub correlation_id: CorrelationId,
    pub attempt: u32,
    /// This attempt wrote a `Dead` entry for the chain.
    pub dead_lettered: bool,
    /// Suggested delay before the next attempt; `None` once the chain is out
    /// of attempts.
    pub retry_after: Option<Duration>,
    /// Set when recording the run or the dead letter failed.
    pub bookkeeping: Option<StoreError>,
}

impl<E> JobFailure<E> {
    pub fn error(&self) -> &E {
        &self.error
    }

    pub fn into_inner(self) -> E {
        self.error
    }

    pub fn should_retry(&self) -> bool {
        self.retry_after.is_some()
    }
}

impl<E: fmt::Display> fmt::Display for JobFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failure on attempt {}: {}",
            self.class.as_str(),
            self.attempt,
            self.error
        )
    }
}

impl<E> std::error::Error for JobFailure<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum DeadLetterError {
    #[error("dead letter not found: {0}")]
    NotFound(DeadLetterId),
    #[error("dead letter {id} is {} and cannot change", .status.as_str())]
    NotDead {
        id: DeadLetterId,
        status: DeadLetterStatus,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct JobRunner<S> {
    store: S,
    backoff: BackoffSchedule,
    max_attempts: u32,
    permanent_policy: PermanentFailurePolicy,
}

impl<S> JobRunner<S>
where
    S: JobStore,
{
    pub fn new(store: S, config: &ReliabilityConfig) -> Self {
        Self {
            store,
            backoff: BackoffSchedule::from_config(config),
            max_attempts: config.job_max_attempts.max(1),
            permanent_policy: config.permanent_failure_policy,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn backoff(&self) -> &BackoffSchedule {
        &self.backoff
    }

    /// Run `work` exactly once and record the outcome.
    pub async fn execute<T, E, F, Fut>(&self, spec: JobSpec, work: F) -> Result<T, JobFailure<E>>
    where
        F: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let correlation_id = spec.correlation_id.unwrap_or_default();
        let attempt = spec.attempt.max(1);
        let max_attempts = spec.max_attempts.unwrap_or(self.max_attempts).max(1);

        let mut run = JobRun::running(
            spec.job_name.clone(),
            spec.owner_id,
            correlation_id,
            attempt,
            Utc::now(),
        );
        let mut bookkeeping = None;
        if let Err(err) = self.store.open_run(&run).await {
            error!(
                job_name = %spec.job_name,
                correlation_id = %correlation_id,
                attempt,
                error = %err,
                "failed to record job run start"
            );
            bookkeeping = Some(err);
        }

        let ctx = JobContext {
            job_name: spec.job_name.clone(),
            owner_id: spec.owner_id,
            correlation_id,
            attempt,
        };

        let error = match work(ctx).await {
            Ok(value) => {
                run.mark_completed(Utc::now());
                if let Err(err) = self.store.finish_run(&run).await {
                    error!(
                        job_name = %spec.job_name,
                        correlation_id = %correlation_id,
                        error = %err,
                        "failed to record job run completion"
                    );
                }
                info!(
                    job_name = %spec.job_name,
                    correlation_id = %correlation_id,
                    attempt,
                    duration_ms = run.duration_ms.unwrap_or_default(),
                    "job completed"
                );
                return Ok(value);
            }
            Err(error) => error,
        };

        let class = error.error_class();
        let message = error.to_string();
        run.mark_failed(class, message.clone(), Utc::now());
        if let Err(err) = self.store.finish_run(&run).await {
            error!(
                job_name = %spec.job_name,
                correlation_id = %correlation_id,
                error = %err,
                "failed to record job run failure"
            );
            bookkeeping.get_or_insert(err);
        }

        let exhausted = attempt >= max_attempts;
        let cut_short = class == ErrorClass::Permanent
            && self.permanent_policy == PermanentFailurePolicy::DeadLetterImmediately;

        if !(exhausted || cut_short) {
            let retry_after = self.backoff.calculate(attempt);
            warn!(
                job_name = %spec.job_name,
                correlation_id = %correlation_id,
                attempt,
                max_attempts,
                class = class.as_str(),
                retry_after_secs = retry_after.as_secs(),
                error = %message,
                "job attempt failed"
            );
            return Err(JobFailure {
                error,
                class,
                correlation_id,
                attempt,
                dead_lettered: false,
                retry_after: Some(retry_after),
                bookkeeping,
            });
        }

        let entry = DeadLetterEntry {
            id: DeadLetterId::new(),
            owner_id: spec.owner_id,
            job_type: spec.job_name.clone(),
            correlation_id,
            attempts: attempt,
            payload_snapshot: spec.payload,
            last_error: message.clone(),
            status: DeadLetterStatus::Dead,
            created_at: Utc::now(),
            resolved_at: None,
        };
        let dead_lettered = match self.store.record_dead_letter(&entry).await {
            Ok(true) => {
                error!(
                    job_name = %spec.job_name,
                    correlation_id = %correlation_id,
                    dead_letter_id = %entry.id,
                    attempt,
                    class = class.as_str(),
                    error = %message,
                    "job dead-lettered"
                );
                true
            }
            Ok(false) => {
                warn!(
                    job_name = %spec.job_name,
                    correlation_id = %correlation_id,
                    "chain already has an open dead letter"
                );
                false
            }
            Err(err) => {
                error!(
                    job_name = %spec.job_name,
                    correlation_id = %correlation_id,
                    error = %err,
                    "failed to record dead letter"
                );
                bookkeeping.get_or_insert(err);
                false
            }
        };

        Err(JobFailure {
            error,
            class,
            correlation_id,
            attempt,
            dead_lettered,
            retry_after: None,
            bookkeeping,
        })
    }

    /// `owner_id` of `None` addresses entries of system jobs.
    pub async fn list_dead_letters(
        &self,
        owner_id: Option<TenantId>,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        Ok(self.store.list_dead_letters(owner_id, status, limit).await?)
    }

    /// Flip `Dead -> Replayed` and return the payload for re-enqueueing.
    pub async fn replay_dead_letter(
        &self,
        owner_id: Option<TenantId>,
        id: DeadLetterId,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        let entry = self
            .resolve_dead_letter(owner_id, id, DeadLetterStatus::Replayed)
            .await?;
        info!(
            dead_letter_id = %id,
            job_type = %entry.job_type,
            correlation_id = %entry.correlation_id,
            "dead letter replayed"
        );
        Ok(entry)
    }

    pub async fn discard_dead_letter(
        &self,
        owner_id: Option<TenantId>,
        id: DeadLetterId,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        let entry = self
            .resolve_dead_letter(owner_id, id, DeadLetterStatus::Discarded)
            .await?;
        info!(dead_letter_id = %id, job_type = %entry.job_type, "dead letter discarded");
        Ok(entry)
    }

    async fn resolve_dead_letter(
        &self,
        owner_id: Option<TenantId>,
        id: DeadLetterId,
        to: DeadLetterStatus,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        // Entries of other tenants are indistinguishable from missing ones.
        let entry = self
            .store
            .get_dead_letter(id)
            .await?
            .filter(|e| e.owner_id == owner_id)
            .ok_or(DeadLetterError::NotFound(id))?;

        if entry.status != DeadLetterStatus::Dead {
            return Err(DeadLetterError::NotDead {
                id,
                status: entry.status,
            });
        }

        let now = Utc::now();
        if !self
            .store
            .transition_dead_letter(id, DeadLetterStatus::Dead, to, now)
            .await?
        {
            let status = self
                .store
                .get_dead_letter(id)
                .await?
                .map(|e| e.status)
                .unwrap_or(to);
            return Err(DeadLetterError::NotDead { id, status });
        }

        Ok(DeadLetterEntry {
            status: to,
            resolved_at: Some(now),
            ..entry
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::jobs::TransportSignal;
    use crate::jobs::types::JobRunStatus;
    use crate::store::InMemoryStore;

    fn runner(store: Arc<InMemoryStore>) -> JobRunner<Arc<InMemoryStore>> {
        JobRunner::new(store, &ReliabilityConfig::default())
    }

    fn runner_with(
        store: Arc<InMemoryStore>,
        policy: PermanentFailurePolicy,
    ) -> JobRunner<Arc<InMemoryStore>> {
        let config = ReliabilityConfig {
            permanent_failure_policy: policy,
            ..ReliabilityConfig::default()
        };
        JobRunner::new(store, &config)
    }

    #[tokio::test]
    async fn success_records_completed_run() {
        let store = InMemoryStore::arc();
        let runner = runner(store.clone());
        let correlation = CorrelationId::new();

        let value = runner
            .execute(
                JobSpec::new("sync_kwik", json!({})).with_correlation(correlation),
                |ctx| async move {
                    assert_eq!(ctx.attempt, 1);
                    Ok::<_, io::Error>(42)
                },
            )
            .await
            .unwrap();
        assert_eq!(value, 42);

        let runs = store.runs_for_correlation(correlation).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, JobRunStatus::Completed);
        assert!(runs[0].duration_ms.is_some());
    }

    #[tokio::test]
    async fn transient_failure_suggests_jittered_backoff() {
        let store = InMemoryStore::arc();
        let runner = runner(store.clone());

        let failure = runner
            .execute(JobSpec::new("sync_kwik", json!({})).with_attempt(2), |_| async {
                Err::<(), _>(io::Error::from(io::ErrorKind::TimedOut))
            })
            .await
            .unwrap_err();

        assert_eq!(failure.class, ErrorClass::Transient);
        assert!(!failure.dead_lettered);
        let delay = failure.retry_after.unwrap().as_secs_f64();
        assert!((84.0..=156.0).contains(&delay), "delay {delay}");
        assert_eq!(store.dead_letter_count(), 0);

        let runs = store.runs_for_correlation(failure.correlation_id).await.unwrap();
        assert_eq!(runs[0].status, JobRunStatus::Failed);
        assert_eq!(runs[0].error_class, Some(ErrorClass::Transient));
        assert_eq!(failure.into_inner().kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn final_attempt_dead_letters_once_and_reraises() {
        let store = InMemoryStore::arc();
        let runner = runner(store.clone());
        let correlation = CorrelationId::new();
        let payload = json!({ "order": "ord_1" });

        let spec = JobSpec::new("notify_courier", payload.clone())
            .with_correlation(correlation)
            .with_attempt(10);
        let first = runner
            .execute(spec.clone(), |_| async {
                Err::<(), _>(TransportSignal::HttpStatus(503))
            })
            .await
            .unwrap_err();
        assert!(first.dead_lettered);
        assert!(!first.should_retry());
        assert_eq!(first.error(), &TransportSignal::HttpStatus(503));

        // A duplicate final attempt finds the open entry and writes nothing.
        let second = runner
            .execute(spec, |_| async { Err::<(), _>(TransportSignal::HttpStatus(503)) })
            .await
            .unwrap_err();
        assert!(!second.dead_lettered);
        assert!(!second.should_retry());
        assert!(second.bookkeeping.is_none());

        assert_eq!(store.dead_letter_count(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_counts_towards_budget_by_default() {
        let store = InMemoryStore::arc();
        let runner = runner(store.clone());

        let failure = runner
            .execute(JobSpec::new("charge", json!({})), |_| async {
                Err::<(), _>(TransportSignal::HttpStatus(422))
            })
            .await
            .unwrap_err();

        assert_eq!(failure.class, ErrorClass::Permanent);
        assert!(!failure.dead_lettered);
        assert!(failure.retry_after.is_some());
    }

    #[tokio::test]
    async fn permanent_failure_can_dead_letter_immediately() {
        let store = InMemoryStore::arc();
        let runner = runner_with(store.clone(), PermanentFailurePolicy::DeadLetterImmediately);

        let failure = runner
            .execute(JobSpec::new("charge", json!({})), |_| async {
                Err::<(), _>(TransportSignal::Validation)
            })
            .await
            .unwrap_err();
        assert!(failure.dead_lettered);
        assert_eq!(store.dead_letter_count(), 1);

        let transient = runner
            .execute(JobSpec::new("charge", json!({})), |_| async {
                Err::<(), _>(TransportSignal::Timeout)
            })
            .await
            .unwrap_err();
        assert!(!transient.dead_lettered);
    }

    #[tokio::test]
    async fn explicit_budget_overrides_config() {
        let store = InMemoryStore::arc();
        let runner = runner(store.clone());

        let failure = runner
            .execute(
                JobSpec::new("sync_kwik", json!({})).with_max_attempts(1),
                |_| async { Err::<(), _>(TransportSignal::ConnectionReset) },
            )
            .await
            .unwrap_err();
        assert!(failure.dead_lettered);
    }

    #[tokio::test]
    async fn replay_and_discard_are_one_shot_and_tenant_scoped() {
        let store = InMemoryStore::arc();
        let runner = runner(store.clone());
        let owner = TenantId::new();
        let payload = json!({ "shipment": "s1" });

        for _ in 0..2 {
            let _ = runner
                .execute(
                    JobSpec::new("sync_kwik", payload.clone())
                        .with_owner(owner)
                        .with_max_attempts(1),
                    |_| async { Err::<(), _>(TransportSignal::Timeout) },
                )
                .await;
        }

        let dead = runner.list_dead_letters(Some(owner), None, 10).await.unwrap();
        assert_eq!(dead.len(), 2);
        let (first, second) = (dead[0].id, dead[1].id);

        let err = runner
            .replay_dead_letter(Some(TenantId::new()), first)
            .await
            .unwrap_err();
        assert_eq!(err, DeadLetterError::NotFound(first));

        let replayed = runner.replay_dead_letter(Some(owner), first).await.unwrap();
        assert_eq!(replayed.status, DeadLetterStatus::Replayed);
        assert_eq!(replayed.payload_snapshot, payload);
        assert!(replayed.resolved_at.is_some());

        let again = runner.replay_dead_letter(Some(owner), first).await.unwrap_err();
        assert!(matches!(
            again,
            DeadLetterError::NotDead { status: DeadLetterStatus::Replayed, .. }
        ));

        let discarded = runner.discard_dead_letter(Some(owner), second).await.unwrap();
        assert_eq!(discarded.status, DeadLetterStatus::Discarded);

        let remaining = runner
            .list_dead_letters(Some(owner), Some(DeadLetterStatus::Dead), 10)
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn replayed_chain_that_fails_again_is_dead_lettered_again() {
        let store = InMemoryStore::arc();
        let runner = runner(store.clone());
        let owner = TenantId::new();
        let payload = json!({ "shipment": "s9" });

        let failure = runner
            .execute(
                JobSpec::new("sync_kwik", payload.clone())
                    .with_owner(owner)
                    .with_max_attempts(1),
                |_| async { Err::<(), _>(TransportSignal::Timeout) },
            )
            .await
            .unwrap_err();
        assert!(failure.dead_lettered);
        let correlation = failure.correlation_id;

        let dead = runner
            .list_dead_letters(Some(owner), Some(DeadLetterStatus::Dead), 10)
            .await
            .unwrap();
        let replayed = runner.replay_dead_letter(Some(owner), dead[0].id).await.unwrap();

        // The operator re-enqueues the snapshot on the same chain and it fails again.
        let again = runner
            .execute(
                JobSpec::new(replayed.job_type.clone(), replayed.payload_snapshot.clone())
                    .with_owner(owner)
                    .with_correlation(correlation)
                    .with_max_attempts(1),
                |_| async { Err::<(), _>(TransportSignal::Timeout) },
            )
            .await
            .unwrap_err();
        assert!(again.dead_lettered);
        assert!(again.bookkeeping.is_none());

        let awaiting = runner
            .list_dead_letters(Some(owner), Some(DeadLetterStatus::Dead), 10)
            .await
            .unwrap();
        assert_eq!(awaiting.len(), 1);
        assert_eq!(awaiting[0].correlation_id, correlation);
        assert_ne!(awaiting[0].id, replayed.id);
        assert_eq!(awaiting[0].payload_snapshot, payload);
        assert_eq!(store.dead_letter_count(), 2);
    }

    #[tokio::test]
    async fn failed_dead_letter_write_is_not_reported_as_dead_lettered() {
        let runner = JobRunner::new(BrokenDeadLetters::default(), &ReliabilityConfig::default());

        let failure = runner
            .execute(JobSpec::new("sync_kwik", json!({})).with_max_attempts(1), |_| async {
                Err::<(), _>(TransportSignal::Timeout)
            })
            .await
            .unwrap_err();
        assert!(!failure.dead_lettered);
        assert!(!failure.should_retry());
        assert!(matches!(failure.bookkeeping, Some(StoreError::Storage(_))));
    }

    /// Runs are kept in memory; dead-letter writes always fail.
    #[derive(Default)]
    struct BrokenDeadLetters {
        runs: InMemoryStore,
    }

    #[async_trait::async_trait]
    impl JobStore for BrokenDeadLetters {
        async fn open_run(&self, run: &JobRun) -> Result<(), StoreError> {
            self.runs.open_run(run).await
        }

        async fn finish_run(&self, run: &JobRun) -> Result<(), StoreError> {
            self.runs.finish_run(run).await
        }

        async fn runs_for_correlation(
            &self,
            correlation_id: CorrelationId,
        ) -> Result<Vec<JobRun>, StoreError> {
            self.runs.runs_for_correlation(correlation_id).await
        }

        async fn record_dead_letter(&self, _entry: &DeadLetterEntry) -> Result<bool, StoreError> {
            Err(StoreError::Storage("dead_letters unavailable".into()))
        }

        async fn get_dead_letter(
            &self,
            id: DeadLetterId,
        ) -> Result<Option<DeadLetterEntry>, StoreError> {
            self.runs.get_dead_letter(id).await
        }

        async fn list_dead_letters(
            &self,
            owner_id: Option<TenantId>,
            status: Option<DeadLetterStatus>,
            limit: usize,
        ) -> Result<Vec<DeadLetterEntry>, StoreError> {
            self.runs.list_dead_letters(owner_id, status, limit).await
        }

        async fn transition_dead_letter(
            &self,
            id: DeadLetterId,
            from: DeadLetterStatus,
            to: DeadLetterStatus,
            now: chrono::DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.runs.transition_dead_letter(id, from, to, now).await
        }
    }
}
